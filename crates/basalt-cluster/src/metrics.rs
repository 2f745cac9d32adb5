// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Cluster metrics.

use basalt_core::Membership;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};

/// Initialize cluster metric descriptions (call once at startup).
pub fn init_cluster_metrics() {
    describe_counter!("basalt_elections_total", "Election attempts by outcome");
    describe_counter!("basalt_votes_total", "Vote requests answered by outcome");
    describe_counter!("basalt_membership_changes_total", "Role transitions by target role");
    describe_gauge!("basalt_node_is_primary", "1 while this node holds the primary role");
    describe_counter!("basalt_lease_renewals_total", "Lease renewals by outcome");
    describe_counter!("basalt_heartbeats_sent_total", "Heartbeats answered by peers");
    describe_counter!("basalt_heartbeats_received_total", "Heartbeats received from the primary");
    describe_counter!("basalt_heartbeat_send_errors_total", "Heartbeats that failed");
    describe_histogram!("basalt_heartbeat_round_duration_seconds", "Time to heartbeat all peers");
}

pub(crate) fn record_election(outcome: &'static str) {
    counter!("basalt_elections_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_vote(granted: bool) {
    let outcome = if granted { "granted" } else { "refused" };
    counter!("basalt_votes_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_membership(membership: Membership) {
    counter!("basalt_membership_changes_total", "to" => membership.as_str()).increment(1);
    let primary = if membership == Membership::Primary { 1.0 } else { 0.0 };
    gauge!("basalt_node_is_primary").set(primary);
}

pub(crate) fn record_lease_renewal(outcome: &'static str) {
    counter!("basalt_lease_renewals_total", "outcome" => outcome).increment(1);
}
