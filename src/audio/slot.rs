// 该文件是 Tingjing （听境） 项目的一部分。
// src/audio/slot.rs - 单槽最新值通道
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct State<T> {
  value: Option<T>,
  closed: bool,
}

struct Shared<T> {
  state: Mutex<State<T>>,
  ready: Condvar,
}

/// 只保存一个值的通道，新值覆盖尚未取走的旧值
pub struct LatestSlot<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for LatestSlot<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T> Default for LatestSlot<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> LatestSlot<T> {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State {
          value: None,
          closed: false,
        }),
        ready: Condvar::new(),
      }),
    }
  }

  /// 返回被覆盖的旧值；通道已关闭时丢弃新值
  pub fn publish(&self, value: T) -> Option<T> {
    let mut state = self.shared.state.lock();
    if state.closed {
      return None;
    }
    let replaced = state.value.replace(value);
    self.shared.ready.notify_one();
    replaced
  }

  /// 阻塞直到有值；关闭后返回 `None`
  pub fn take_blocking(&self) -> Option<T> {
    let mut state = self.shared.state.lock();
    loop {
      if state.closed {
        return None;
      }
      if let Some(value) = state.value.take() {
        return Some(value);
      }
      self.shared.ready.wait(&mut state);
    }
  }

  pub fn try_take(&self) -> Option<T> {
    self.shared.state.lock().value.take()
  }

  /// 关闭通道并丢弃未取走的值
  pub fn close(&self) {
    let mut state = self.shared.state.lock();
    state.closed = true;
    state.value = None;
    self.shared.ready.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().closed
  }
}

#[cfg(test)]
mod tests {
  use std::{thread, time::Duration};

  use super::*;

  #[test]
  fn newer_value_replaces_unconsumed_one() {
    let slot = LatestSlot::new();
    assert_eq!(slot.publish(1), None);
    assert_eq!(slot.publish(2), Some(1));
    assert_eq!(slot.take_blocking(), Some(2));
    assert_eq!(slot.try_take(), None);
  }

  #[test]
  fn close_wakes_a_blocked_reader() {
    let slot = LatestSlot::<u32>::new();
    let reader = {
      let slot = slot.clone();
      thread::spawn(move || slot.take_blocking())
    };
    thread::sleep(Duration::from_millis(20));
    slot.close();
    assert_eq!(reader.join().unwrap(), None);
  }

  #[test]
  fn publish_after_close_is_dropped() {
    let slot = LatestSlot::new();
    slot.close();
    slot.publish("late");
    assert!(slot.is_closed());
    assert_eq!(slot.try_take(), None);
  }
}
