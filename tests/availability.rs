use governor::clock::FakeRelativeClock;
use pipeline_worker_lib::availability::{
    AvailabilityRegistry, AvailabilityVoter, ClusterAvailable, MAX_SILENCE, TICKET_THRESHOLD,
};
use std::time::Duration;

fn voter() -> (AvailabilityVoter<FakeRelativeClock>, FakeRelativeClock) {
    let clock = FakeRelativeClock::default();
    (AvailabilityVoter::with_clock("10.0.0.1:9200", clock.clone()), clock)
}

#[test]
fn a_burst_of_failures_counts_as_one_vote() {
    let (voter, clock) = voter();
    voter.report_success();

    for _ in 0..1_000 {
        assert!(!voter.report_failure());
        clock.advance(Duration::from_micros(500));
    }

    let state = voter.snapshot();
    assert!(state.reachable);
    assert_eq!(state.failure_ticket, 1);
}

#[test]
fn alternating_reports_never_flip_a_healthy_target() {
    let (voter, clock) = voter();
    for _ in 0..60 {
        clock.advance(Duration::from_millis(500));
        voter.report_failure();
        clock.advance(Duration::from_millis(500));
        voter.report_success();
    }
    // Votes pile up past the threshold, but silence never exceeds the gate.
    assert!(voter.is_available());
    assert!(voter.snapshot().failure_ticket >= TICKET_THRESHOLD);
}

#[test]
fn silence_alone_downs_the_target() {
    let (voter, clock) = voter();
    voter.report_success();
    clock.advance(MAX_SILENCE + Duration::from_secs(1));

    assert!(voter.report_failure());
    assert!(!voter.is_available());
}

#[test]
fn silence_without_failure_reports_changes_nothing() {
    let (voter, clock) = voter();
    clock.advance(Duration::from_secs(60));
    assert!(voter.is_available());
}

#[test]
fn cluster_condition_follows_votes() {
    let clock = FakeRelativeClock::default();
    let registry = AvailabilityRegistry::with_clock(clock.clone());
    registry.register_cluster("prod", true, true);
    registry.register_cluster("staging", true, true);
    let both = ClusterAvailable::new(vec!["prod".to_string(), "staging".to_string()]);
    assert_eq!(both.check(&registry), Ok(true));

    clock.advance(Duration::from_secs(11));
    registry
        .cluster_voter("staging")
        .expect("voter")
        .report_failure();
    assert_eq!(both.check(&registry), Ok(false));

    registry
        .cluster_voter("staging")
        .expect("voter")
        .report_success();
    assert_eq!(both.check(&registry), Ok(true));
}
