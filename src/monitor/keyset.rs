use crate::monitor::aggregator::AggregatorSnapshot;
use crate::monitor::types::DashboardFrame;
use std::collections::BTreeSet;

/// Sorted, deduplicated union of source keys. Every view renders against this
/// sequence so the latency and distribution panels always list the same
/// sources in the same order.
pub fn resolve<'a, H, L, D>(historical_keys: H, live_keys: L, distribution_keys: D) -> Vec<String>
where
    H: IntoIterator<Item = &'a String>,
    L: IntoIterator<Item = &'a String>,
    D: IntoIterator<Item = &'a String>,
{
    historical_keys
        .into_iter()
        .chain(live_keys)
        .chain(distribution_keys)
        .map(String::as_str)
        .collect::<BTreeSet<&str>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn resolve_snapshot(snapshot: &AggregatorSnapshot) -> Vec<String> {
    resolve(
        snapshot.historical.keys(),
        snapshot.live.keys(),
        snapshot.distribution.keys(),
    )
}

pub fn build_frame(snapshot: AggregatorSnapshot) -> DashboardFrame {
    let keys = resolve_snapshot(&snapshot);
    DashboardFrame {
        revision: snapshot.revision,
        keys,
        historical: snapshot.historical,
        live: snapshot.live,
        distribution: snapshot.distribution,
    }
}
