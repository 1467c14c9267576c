use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// Emission timestamps retained per channel.
const HISTORY: usize = 10;

/// Per-channel delayed emission with coalescing.
///
/// `emit_delayed(channel, min_gap, msg)` schedules `msg` onto the owning
/// reconciler's signal channel. While an emit is pending for a channel,
/// further calls collapse into it. If the previous emit on the channel
/// happened less than `min_gap` ago, the new one is pushed out so the
/// inter-emit interval stays at least `min_gap`. No ordering is guaranteed
/// across distinct channels.
pub struct Debouncer<M> {
    tx: UnboundedSender<M>,
    channels: HashMap<String, Arc<Mutex<ChannelState>>>,
}

#[derive(Default)]
struct ChannelState {
    pending: bool,
    history: VecDeque<Instant>,
}

impl<M: Send + 'static> Debouncer<M> {
    pub fn new(tx: UnboundedSender<M>) -> Self {
        Self {
            tx,
            channels: HashMap::new(),
        }
    }

    pub fn emit_delayed(&mut self, channel: &str, min_gap: Duration, msg: M) {
        let state = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ChannelState::default())));

        let delay = {
            let mut st = state.lock().unwrap();
            if st.pending {
                return;
            }
            st.pending = true;
            st.history
                .back()
                .map(|last| min_gap.saturating_sub(last.elapsed()))
                .unwrap_or(Duration::ZERO)
        };

        let state = Arc::clone(state);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            {
                let mut st = state.lock().unwrap();
                st.pending = false;
                st.history.push_back(Instant::now());
                if st.history.len() > HISTORY {
                    st.history.pop_front();
                }
            }
            let _ = tx.send(msg);
        });
    }
}
