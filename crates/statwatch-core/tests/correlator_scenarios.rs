//! End-to-end correlation scenarios driven through the public API.
//!
//! Time is paused in every test; `settle()` returns once all lanes are idle.

mod common;

use std::time::Duration;

use common::{Collector, ScriptedFetch, USER, harness, osu_score, settle, signal};
use statwatch_core::{
    IngressDecision, RegistrationState, RulesetId, ScoreId, ScoreIdentity, ScoreProcessedSignal,
    SignalOutcome, UserId,
};
use tokio::sync::mpsc;

// =========================================================================
// Observed scenarios
// =========================================================================

#[tokio::test(start_paused = true)]
async fn scenario_a_register_then_server_advance() {
    let h = harness(4_000_000);
    let (_handle, rx) = h.correlator.register_oneshot(osu_score(50001)).unwrap();

    h.provider.set_server(USER, "osu", 5_000_000);
    assert_eq!(h.ingress.forward(signal(50001)).await, IngressDecision::Forwarded);

    let update = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.score.id, ScoreId(50001));
    assert_eq!(update.before.total_score, 4_000_000);
    assert_eq!(update.after.total_score, 5_000_000);
    assert_eq!(update.total_score_delta(), 1_000_000);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_server_advance_before_registration() {
    let h = harness(4_000_000);
    h.provider.set_server(USER, "osu", 5_000_000);
    let (_handle, rx) = h.correlator.register_oneshot(osu_score(50001)).unwrap();

    h.ingress.forward(signal(50001)).await;

    let update = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.before.total_score, 4_000_000);
    assert_eq!(update.after.total_score, 5_000_000);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_unmatched_signal_merges_into_next() {
    let h = harness(4_000_000);

    h.provider.set_server(USER, "osu", 5_000_000);
    h.ingress.forward(signal(50001)).await;
    settle().await;
    let entry = h
        .correlator
        .ledger_entry(USER, &RulesetId::from("osu"))
        .unwrap();
    assert_eq!(entry.before.total_score, 4_000_000);
    assert_eq!(entry.after.total_score, 5_000_000);

    let (_handle, rx) = h.correlator.register_oneshot(osu_score(50002)).unwrap();
    h.provider.set_server(USER, "osu", 6_000_000);
    h.ingress.forward(signal(50002)).await;

    let update = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.score.id, ScoreId(50002));
    assert_eq!(update.before.total_score, 4_000_000);
    assert_eq!(update.after.total_score, 6_000_000);
    assert_eq!(h.correlator.open_ledger_entries(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_logout_before_signal_never_fires() {
    let h = harness(4_000_000);
    let collector = Collector::default();
    let handle = h
        .correlator
        .register(osu_score(50001), collector.callback())
        .unwrap();

    let (tx, rx) = mpsc::channel(8);
    let run = tokio::spawn(h.ingress.clone().run(rx, h.session.subscribe()));
    tokio::task::yield_now().await;

    h.session.logout();
    tokio::task::yield_now().await;
    h.provider.set_server(USER, "osu", 5_000_000);
    tx.send(signal(50001)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(collector.updates().is_empty());
    assert_eq!(handle.state(), RegistrationState::Disposed);
    assert_eq!(h.provider.fetch_count(), 0);

    drop(tx);
    run.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scenario_e_disposed_handle_never_fires() {
    let h = harness(4_000_000);
    let collector = Collector::default();
    let handle = h
        .correlator
        .register(osu_score(50001), collector.callback())
        .unwrap();
    handle.dispose();

    h.provider.set_server(USER, "osu", 5_000_000);
    h.ingress.forward(signal(50001)).await;
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert!(collector.updates().is_empty());
    assert_eq!(handle.state(), RegistrationState::Disposed);
    // The signal still advanced the ledger as an orphan.
    assert_eq!(h.correlator.open_ledger_entries(), 1);
}

// =========================================================================
// Merge law
// =========================================================================

#[tokio::test(start_paused = true)]
async fn consecutive_orphans_keep_first_baseline_and_last_fetch() {
    let h = harness(4_000_000);
    for (id, total) in [(1, 4_500_000), (2, 5_000_000), (3, 5_500_000)] {
        h.provider.set_server(USER, "osu", total);
        assert_eq!(
            h.correlator.process_signal(signal(id)).await,
            SignalOutcome::Merged
        );
    }

    let entry = h
        .correlator
        .ledger_entry(USER, &RulesetId::from("osu"))
        .unwrap();
    assert_eq!(entry.before.total_score, 4_000_000);
    assert_eq!(entry.after.total_score, 5_500_000);
    assert_eq!(entry.signals, 3);

    let (_handle, rx) = h.correlator.register_oneshot(osu_score(4)).unwrap();
    h.provider.set_server(USER, "osu", 6_000_000);
    assert_eq!(
        h.correlator.process_signal(signal(4)).await,
        SignalOutcome::Delivered
    );
    let update = rx.await.unwrap();
    assert_eq!(update.before.total_score, 4_000_000);
    assert_eq!(update.after.total_score, 6_000_000);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_between_orphans_is_skipped() {
    let h = harness(4_000_000);
    h.provider.set_server(USER, "osu", 5_000_000);
    h.correlator.process_signal(signal(1)).await;

    h.provider.fail_next();
    assert_eq!(
        h.correlator.process_signal(signal(2)).await,
        SignalOutcome::FetchFailed
    );

    let entry = h
        .correlator
        .ledger_entry(USER, &RulesetId::from("osu"))
        .unwrap();
    assert_eq!(entry.after.total_score, 5_000_000);
    assert_eq!(entry.signals, 1);
    assert_eq!(h.correlator.telemetry().fetch_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn baseline_is_read_once_per_entry() {
    let h = harness(4_000_000);
    h.provider.set_server(USER, "osu", 5_000_000);
    h.correlator.process_signal(signal(1)).await;

    // A later baseline change must not rewrite `before` of the open entry.
    h.provider.seed(USER, "osu", 7_000_000);
    h.correlator.process_signal(signal(2)).await;

    let entry = h
        .correlator
        .ledger_entry(USER, &RulesetId::from("osu"))
        .unwrap();
    assert_eq!(entry.before.total_score, 4_000_000);
    assert_eq!(entry.after.total_score, 7_000_000);
}

// =========================================================================
// Session scoping
// =========================================================================

#[tokio::test(start_paused = true)]
async fn user_switch_drops_previous_users_state() {
    let h = harness(4_000_000);
    let (handle, rx) = h.correlator.register_oneshot(osu_score(10)).unwrap();
    h.correlator.process_signal(signal(11)).await;
    assert_eq!(h.correlator.open_ledger_entries(), 1);

    h.session.login(UserId(2002));
    h.correlator.handle_session_change(Some(UserId(2002)));

    assert_eq!(handle.state(), RegistrationState::Disposed);
    assert!(rx.await.is_err());
    assert_eq!(h.correlator.open_ledger_entries(), 0);
    assert_eq!(h.correlator.pending_registrations(), 0);

    let decision = h.ingress.forward(signal(10)).await;
    assert_eq!(decision, IngressDecision::Dropped);
    assert_eq!(h.provider.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn logout_during_fetch_discards_result() {
    let h = harness(4_000_000);
    let collector = Collector::default();
    let handle = h
        .correlator
        .register(osu_score(50001), collector.callback())
        .unwrap();
    let gate = h.provider.gate("osu");

    h.provider.set_server(USER, "osu", 5_000_000);
    h.ingress.forward(signal(50001)).await;
    settle().await;
    assert_eq!(h.provider.fetch_count(), 1);

    h.session.logout();
    gate.add_permits(1);
    settle().await;

    assert!(collector.updates().is_empty());
    assert_eq!(h.correlator.open_ledger_entries(), 0);
    assert_eq!(h.correlator.telemetry().signals_dropped_session, 1);
    // Logout without a session-change notification leaves the handle alone.
    assert_eq!(handle.state(), RegistrationState::Pending);
}

#[tokio::test(start_paused = true)]
async fn registering_for_another_user_is_rejected() {
    let h = harness(0);
    let foreign = ScoreIdentity::new(ScoreId(5), RulesetId::from("osu"), UserId(9));
    assert!(h.correlator.register(foreign, |_| {}).is_err());
    assert_eq!(h.correlator.pending_registrations(), 0);
}

// =========================================================================
// Handles
// =========================================================================

#[tokio::test(start_paused = true)]
async fn dispose_is_idempotent() {
    let h = harness(0);
    let handle = h.correlator.register(osu_score(1), |_| {}).unwrap();

    handle.dispose();
    handle.dispose();
    assert_eq!(handle.state(), RegistrationState::Disposed);
    drop(handle);

    assert_eq!(h.correlator.telemetry().registrations_disposed, 1);
    assert_eq!(h.correlator.pending_registrations(), 0);
}

#[tokio::test(start_paused = true)]
async fn dispose_after_resolution_is_noop() {
    let h = harness(0);
    let collector = Collector::default();
    let handle = h
        .correlator
        .register(osu_score(1), collector.callback())
        .unwrap();
    h.correlator.process_signal(signal(1)).await;

    handle.dispose();
    assert_eq!(handle.state(), RegistrationState::Resolved);
    assert_eq!(collector.updates().len(), 1);
    assert_eq!(h.correlator.telemetry().registrations_disposed, 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_handle_cancels_detach_keeps() {
    let h = harness(0);

    let dropped = Collector::default();
    drop(h.correlator.register(osu_score(1), dropped.callback()).unwrap());
    assert_eq!(h.correlator.pending_registrations(), 0);

    let detached = Collector::default();
    h.correlator
        .register(osu_score(2), detached.callback())
        .unwrap()
        .detach();
    assert_eq!(h.correlator.pending_registrations(), 1);

    h.correlator.process_signal(signal(2)).await;
    assert_eq!(detached.updates().len(), 1);
    assert!(dropped.updates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn score_fires_at_most_once() {
    let h = harness(0);
    let collector = Collector::default();
    let _handle = h
        .correlator
        .register(osu_score(1), collector.callback())
        .unwrap();

    h.ingress.forward(signal(1)).await;
    h.ingress.forward(signal(1)).await;
    settle().await;

    assert_eq!(collector.updates().len(), 1);
    // The duplicate became an orphan.
    assert_eq!(h.correlator.open_ledger_entries(), 1);
}

// =========================================================================
// Lanes
// =========================================================================

#[tokio::test(start_paused = true)]
async fn same_key_signals_apply_in_arrival_order() {
    let h = harness(4_000_000);
    let (_handle, rx) = h.correlator.register_oneshot(osu_score(2)).unwrap();

    h.provider
        .push_script(ScriptedFetch::Delayed(Duration::from_millis(500), 5_000_000));
    h.provider
        .push_script(ScriptedFetch::Delayed(Duration::from_millis(1), 6_000_000));

    h.ingress.forward(signal(1)).await;
    h.ingress.forward(signal(2)).await;
    settle().await;

    let update = rx.await.unwrap();
    assert_eq!(update.before.total_score, 4_000_000);
    assert_eq!(update.after.total_score, 6_000_000);
    // The slow first fetch finished before the second started, so nothing
    // is left over to reopen the ledger.
    assert_eq!(h.correlator.open_ledger_entries(), 0);
    assert_eq!(h.provider.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn different_keys_run_in_parallel() {
    let h = harness(1_000);
    h.provider.seed(USER, "taiko", 200);
    h.provider.set_server(USER, "taiko", 300);
    let osu_gate = h.provider.gate("osu");

    let osu = Collector::default();
    let taiko = Collector::default();
    let _osu_handle = h.correlator.register(osu_score(1), osu.callback()).unwrap();
    let _taiko_handle = h
        .correlator
        .register(
            ScoreIdentity::new(ScoreId(2), RulesetId::from("taiko"), USER),
            taiko.callback(),
        )
        .unwrap();

    h.ingress.forward(signal(1)).await;
    h.ingress.forward(signal(2)).await;
    settle().await;

    assert!(osu.updates().is_empty());
    let taiko_updates = taiko.updates();
    assert_eq!(taiko_updates.len(), 1);
    assert_eq!(taiko_updates[0].before.total_score, 200);
    assert_eq!(taiko_updates[0].after.total_score, 300);

    osu_gate.add_permits(1);
    settle().await;
    assert_eq!(osu.updates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_registration_after_orphan_is_resolved() {
    let h = harness(4_000_000);
    h.provider.set_server(USER, "osu", 5_000_000);
    h.ingress.forward(signal(50001)).await;
    settle().await;

    let (_handle, rx) = h.correlator.register_oneshot(osu_score(50001)).unwrap();
    let update = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.before.total_score, 4_000_000);
    assert_eq!(update.after.total_score, 5_000_000);
}

#[tokio::test(start_paused = true)]
async fn merged_orphan_is_not_delivered_again_on_late_registration() {
    let h = harness(4_000_000);
    h.provider.set_server(USER, "osu", 5_000_000);
    h.ingress.forward(signal(50001)).await;
    settle().await;

    let (_handle, rx) = h.correlator.register_oneshot(osu_score(50002)).unwrap();
    h.provider.set_server(USER, "osu", 6_000_000);
    h.ingress.forward(signal(50002)).await;
    let update = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.before.total_score, 4_000_000);
    assert_eq!(update.after.total_score, 6_000_000);

    let late = Collector::default();
    let handle = h
        .correlator
        .register(osu_score(50001), late.callback())
        .unwrap();
    settle().await;

    assert!(late.updates().is_empty());
    assert_eq!(handle.state(), RegistrationState::Pending);
    assert_eq!(h.provider.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn dispose_during_fetch_suppresses_callback() {
    let h = harness(4_000_000);
    let collector = Collector::default();
    let handle = h
        .correlator
        .register(osu_score(50001), collector.callback())
        .unwrap();
    let gate = h.provider.gate("osu");

    h.provider.set_server(USER, "osu", 5_000_000);
    h.ingress.forward(signal(50001)).await;
    settle().await;
    assert_eq!(h.provider.fetch_count(), 1);

    handle.dispose();
    gate.add_permits(1);
    settle().await;

    assert!(collector.updates().is_empty());
    assert_eq!(handle.state(), RegistrationState::Disposed);
    // The fetched delta stays open as an orphan.
    assert_eq!(h.correlator.open_ledger_entries(), 1);
    let entry = h
        .correlator
        .ledger_entry(USER, &RulesetId::from("osu"))
        .unwrap();
    assert_eq!(entry.after.total_score, 5_000_000);
}

#[tokio::test(start_paused = true)]
async fn registration_under_other_ruleset_mid_fetch_leaves_ledger_alone() {
    let h = harness(4_000_000);
    h.provider.seed(USER, "taiko", 200);
    h.provider.set_server(USER, "taiko", 300);
    let osu_gate = h.provider.gate("osu");

    // No registration yet, so the signal is keyed to the active ruleset.
    h.ingress.forward(signal(7)).await;
    settle().await;

    let taiko = Collector::default();
    let _handle = h
        .correlator
        .register(
            ScoreIdentity::new(ScoreId(7), RulesetId::from("taiko"), USER),
            taiko.callback(),
        )
        .unwrap();
    osu_gate.add_permits(1);
    settle().await;

    let updates = taiko.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].before.total_score, 200);
    assert_eq!(updates[0].after.total_score, 300);
    assert!(
        h.correlator
            .ledger_entry(USER, &RulesetId::from("osu"))
            .is_none()
    );
    assert_eq!(h.correlator.open_ledger_entries(), 0);
}

#[tokio::test(start_paused = true)]
async fn ingress_run_forwards_until_channel_closes() {
    let h = harness(10);
    let collector = Collector::default();
    let _handle = h
        .correlator
        .register(osu_score(1), collector.callback())
        .unwrap();

    let (tx, rx) = mpsc::channel(4);
    let run = tokio::spawn(h.ingress.clone().run(rx, h.session.subscribe()));

    tx.send(ScoreProcessedSignal::new(UserId(77), ScoreId(1)))
        .await
        .unwrap();
    tx.send(signal(1)).await.unwrap();
    drop(tx);
    run.await.unwrap();
    settle().await;

    assert_eq!(collector.updates().len(), 1);
    let t = h.correlator.telemetry();
    assert_eq!(t.signals_received, 2);
    assert_eq!(t.signals_dropped_session, 1);
    assert_eq!(t.updates_delivered, 1);
}
