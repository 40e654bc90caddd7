//! Watch set: which channels the engine subscribes to, and why.
//!
//! Each live order (by external id) and open position (by uuid) holds a
//! reference on its symbol's channel. The first holder opens the pub/sub
//! subscription; removing the last drops it.

use arara_data::{feed::MarketChannel, FnvIndexMap, FnvIndexSet};
use smol_str::SmolStr;

#[derive(Debug, Default)]
pub struct WatchSet {
    inner: FnvIndexMap<MarketChannel, FnvIndexSet<SmolStr>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a holder. Returns true when the channel was not previously
    /// watched, ie/ a subscription must be opened.
    pub fn add(&mut self, channel: MarketChannel, holder: impl Into<SmolStr>) -> bool {
        let holders = self.inner.entry(channel).or_default();
        let newly_watched = holders.is_empty();
        holders.insert(holder.into());
        newly_watched
    }

    /// Drop a holder. Returns true when this removed the channel's last
    /// holder, ie/ the subscription must be dropped.
    pub fn remove(&mut self, channel: &MarketChannel, holder: &str) -> bool {
        let Some(holders) = self.inner.get_mut(channel) else {
            return false;
        };
        holders.shift_remove(holder);
        if holders.is_empty() {
            self.inner.shift_remove(channel);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, channel: &MarketChannel) -> bool {
        self.inner.contains_key(channel)
    }

    pub fn holder_count(&self, channel: &MarketChannel) -> usize {
        self.inner.get(channel).map(FnvIndexSet::len).unwrap_or(0)
    }

    /// All watched channels, for resubscribe-all on reconnect.
    pub fn channels(&self) -> Vec<MarketChannel> {
        self.inner.keys().cloned().collect()
    }
}
