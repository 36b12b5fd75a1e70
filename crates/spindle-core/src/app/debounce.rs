//! Debouncer - 連続したトリガーを 1 回のパスにまとめる
//!
//! トリガーのたびに締め切りを `window` だけ先に延ばす。締め切りまで
//! 新しいトリガーが来なければ `fired` が完了する。
//! tokio の時間を使うので、テストでは `start_paused` で決定的に動かせる。

use std::time::Duration;

use tokio::time::{Instant, sleep_until};

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Arm (or re-arm) the timer.
    pub fn trigger(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Completes once the window has elapsed since the last trigger.
    /// Never completes while disarmed. Cancel-safe: dropping the future keeps the deadline.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
