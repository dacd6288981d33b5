// 该文件是 Tingjing （听境） 项目的一部分。
// src/scene/filter.rs - 时间滤波
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

/// 新值连续出现 `hold_frames` 次后才被采纳
///
/// 逐帧分类器本身不带记忆，需要平滑时在外面包一层。
#[derive(Debug, Clone)]
pub struct StableState<T> {
  current: T,
  candidate: Option<(T, usize)>,
  hold_frames: usize,
}

impl<T: Clone + PartialEq> StableState<T> {
  pub fn new(initial: T, hold_frames: usize) -> Self {
    Self {
      current: initial,
      candidate: None,
      hold_frames: hold_frames.max(1),
    }
  }

  pub fn current(&self) -> &T {
    &self.current
  }

  pub fn update(&mut self, observed: T) -> &T {
    if observed == self.current {
      self.candidate = None;
      return &self.current;
    }

    let count = match self.candidate.take() {
      Some((value, count)) if value == observed => count + 1,
      _ => 1,
    };

    if count >= self.hold_frames {
      self.current = observed;
    } else {
      self.candidate = Some((observed, count));
    }
    &self.current
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hold_of_one_follows_input() {
    let mut state = StableState::new('a', 1);
    assert_eq!(*state.update('b'), 'b');
    assert_eq!(*state.update('c'), 'c');
  }

  #[test]
  fn flicker_is_ignored() {
    let mut state = StableState::new('a', 3);
    assert_eq!(*state.update('b'), 'a');
    assert_eq!(*state.update('a'), 'a');
    assert_eq!(*state.update('b'), 'a');
    assert_eq!(*state.update('b'), 'a');
    assert_eq!(*state.update('b'), 'b');
  }

  #[test]
  fn competing_candidates_restart_the_count() {
    let mut state = StableState::new(0, 2);
    state.update(1);
    state.update(2);
    assert_eq!(*state.current(), 0);
    assert_eq!(*state.update(2), 2);
  }
}
