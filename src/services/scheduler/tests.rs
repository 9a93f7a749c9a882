//! Tests for the Scheduler module

use super::*;
use crate::domain::event::{DeliveryStatus, TransitionKind};
use crate::domain::types::{GeoPoint, Site, SiteId, SourceProtocol, Subject};
use crate::services::directory::StaticDirectory;
use crate::services::dispatcher::{create_dispatcher, DispatchSettings, Dispatcher};
use crate::services::geofence_index::FixedSiteIndex;
use crate::services::normalizer::{Normalizer, RawPayload};
use crate::io::notifier::LogChannel;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::tempdir;

const CENTER: GeoPoint = GeoPoint { lat: 25.650648, lng: -100.373529 };
const METERS_PER_DEG_LAT: f64 = 111_194.93;
const SUBJECT: SubjectId = SubjectId(1);
const SITE: SiteId = SiteId(1);

fn north_of_center(meters: f64) -> GeoPoint {
    GeoPoint::new(CENTER.lat + meters / METERS_PER_DEG_LAT, CENTER.lng)
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn site() -> Site {
    Site {
        id: SITE,
        label: "Plant".to_string(),
        center: CENTER,
        radius_m: 15.0,
        enabled: true,
        group: "north".to_string(),
    }
}

fn report(meters_north: f64, secs: i64) -> LocationReport {
    LocationReport {
        subject_id: SUBJECT,
        position: north_of_center(meters_north),
        accuracy_m: Some(5.0),
        reported_at: at(secs),
        received_at: Utc::now(),
        source: SourceProtocol::Push,
        speed_mps: None,
        bearing_deg: None,
        battery_pct: None,
    }
}

/// Site index that can be switched off to simulate an unreachable site source
struct ToggleIndex {
    inner: FixedSiteIndex,
    available: AtomicBool,
}

#[async_trait]
impl SiteIndex for ToggleIndex {
    async fn snapshot(&self) -> Result<Arc<SiteSnapshot>, DetectError> {
        if self.available.load(Ordering::Relaxed) {
            self.inner.snapshot().await
        } else {
            Err(DetectError::SiteIndexUnavailable { reason: "source down".to_string() })
        }
    }
}

/// Test harness that keeps the dispatcher (and its receiver) alive so enqueues succeed
struct Harness {
    scheduler: Arc<Scheduler>,
    index: Arc<ToggleIndex>,
    directory: Arc<StaticDirectory>,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    harness_with_config(Config::default().with_gap_fill(120, 100.0, 10))
}

fn harness_with_config(config: Config) -> Harness {
    harness_with_events(config, Arc::new(EventLog::in_memory()))
}

fn harness_with_events(config: Config, events: Arc<EventLog>) -> Harness {
    let subjects = vec![Subject { id: SUBJECT, tracker_id: "ana".to_string(), active: true }];
    let mut groups = HashMap::new();
    groups.insert("north".to_string(), vec!["ops@example.com".to_string()]);
    let directory = Arc::new(StaticDirectory::new(subjects, groups));

    let index = Arc::new(ToggleIndex {
        inner: FixedSiteIndex::new(vec![site()], config.prefilter_margin_m()),
        available: AtomicBool::new(true),
    });
    let metrics = Arc::new(Metrics::new());
    let (sender, dispatcher) = create_dispatcher(
        64,
        events.clone(),
        Arc::new(LogChannel),
        directory.clone(),
        DispatchSettings::from_config(&config),
        metrics.clone(),
    );

    let scheduler = Scheduler::new(
        &config,
        Arc::new(ContainmentStore::new()),
        index.clone(),
        Arc::new(ReportLog::in_memory()),
        events,
        directory.clone(),
        sender,
        metrics,
    );
    Harness { scheduler: Arc::new(scheduler), index, directory, dispatcher }
}

fn kinds(events: &[GeofenceEvent]) -> Vec<TransitionKind> {
    events.iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn test_reference_scenario() {
    let h = harness();
    let s = &h.scheduler;

    assert!(s.on_report(report(50.0, 0)).await.unwrap().is_empty());
    assert!(!s.store().get(SUBJECT, SITE).unwrap().inside);

    let entered = s.on_report(report(10.0, 30)).await.unwrap();
    assert_eq!(kinds(&entered), vec![TransitionKind::Enter]);
    assert!(!entered[0].synthetic);

    assert!(s.on_report(report(12.0, 60)).await.unwrap().is_empty());

    let exited = s.on_report(report(40.0, 90)).await.unwrap();
    assert_eq!(kinds(&exited), vec![TransitionKind::Exit]);
    assert!(!s.store().get(SUBJECT, SITE).unwrap().inside);

    let logged = s.events().events_for(SUBJECT, SITE);
    assert_eq!(kinds(&logged), vec![TransitionKind::Enter, TransitionKind::Exit]);
    assert!(logged.iter().all(|e| e.status == DeliveryStatus::Pending));
}

#[tokio::test]
async fn test_identical_replay_emits_once() {
    let h = harness();
    let s = &h.scheduler;
    s.on_report(report(50.0, 0)).await.unwrap();

    let inside = report(10.0, 30);
    assert_eq!(s.on_report(inside.clone()).await.unwrap().len(), 1);
    assert!(s.on_report(inside).await.unwrap().is_empty());
    assert_eq!(s.events().len(), 1);
}

#[tokio::test]
async fn test_same_fix_via_both_protocols_emits_at_most_once() {
    let h = harness();
    let s = &h.scheduler;
    let normalizer = Normalizer::new(h.directory.clone());
    s.on_report(report(50.0, 0)).await.unwrap();

    let fix = north_of_center(10.0);
    let body = format!(
        r#"{{"_type":"location","lat":{},"lon":{},"tst":{},"acc":5}}"#,
        fix.lat,
        fix.lng,
        at(30).timestamp()
    );
    let query = format!(
        "id=ana&lat={}&lon={}&timestamp={}&accuracy=5",
        fix.lat,
        fix.lng,
        at(30).timestamp()
    );

    let via_push = normalizer
        .normalize(RawPayload::Push { tracker_id: "ana", body: body.as_bytes() }, Utc::now())
        .unwrap();
    let via_poll = normalizer.normalize(RawPayload::Poll { query: &query }, Utc::now()).unwrap();

    let first = s.on_report(via_push).await.unwrap();
    let second = s.on_report(via_poll).await.unwrap();
    assert_eq!(first.len() + second.len(), 1);
    assert_eq!(s.events().len(), 1);
}

#[tokio::test]
async fn test_gap_fill_catches_crossing_between_sparse_fixes() {
    let h = harness();
    let s = &h.scheduler;

    // 200m north, then 200m south ten minutes later: both ends outside
    s.on_report(report(200.0, 0)).await.unwrap();
    let events = s.on_report(report(-200.0, 600)).await.unwrap();

    let enters: Vec<&GeofenceEvent> = events.iter().filter(|e| e.kind == TransitionKind::Enter).collect();
    assert_eq!(enters.len(), 1);
    assert!(enters[0].synthetic);
    assert!(enters[0].timestamp > at(0) && enters[0].timestamp < at(600));
    assert!(!s.store().get(SUBJECT, SITE).unwrap().inside);

    // Synthetic points are never stored as reports
    assert_eq!(s.reports().latest(SUBJECT).unwrap().reported_at, at(600));
}

#[tokio::test]
async fn test_gap_fill_outside_to_inside_single_enter() {
    let h = harness();
    let s = &h.scheduler;

    s.on_report(report(300.0, 0)).await.unwrap();
    let events = s.on_report(report(5.0, 600)).await.unwrap();
    assert_eq!(kinds(&events), vec![TransitionKind::Enter]);
}

#[tokio::test]
async fn test_short_gap_crossing_is_an_accepted_miss() {
    let h = harness();
    let s = &h.scheduler;

    // 60m in 60s stays under both gap thresholds, so nothing is interpolated
    s.on_report(report(30.0, 0)).await.unwrap();
    let events = s.on_report(report(-30.0, 60)).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_low_confidence_report_stored_not_evaluated() {
    let h = harness();
    let s = &h.scheduler;
    s.on_report(report(50.0, 0)).await.unwrap();

    let mut noisy = report(5.0, 30);
    noisy.accuracy_m = Some(300.0);
    assert!(s.on_report(noisy).await.unwrap().is_empty());

    assert!(!s.store().get(SUBJECT, SITE).unwrap().inside);
    assert_eq!(s.reports().latest(SUBJECT).unwrap().reported_at, at(30));
}

#[tokio::test]
async fn test_pending_duplicate_is_coalesced() {
    let h = harness();
    let s = &h.scheduler;

    s.on_report(report(50.0, 0)).await.unwrap();
    assert_eq!(s.on_report(report(5.0, 30)).await.unwrap().len(), 1);
    assert_eq!(s.on_report(report(50.0, 60)).await.unwrap().len(), 1);

    // Enter again while the first enter is still pending
    assert!(s.on_report(report(5.0, 90)).await.unwrap().is_empty());
    assert!(s.store().get(SUBJECT, SITE).unwrap().inside);
    assert_eq!(s.events().len(), 2);
}

#[tokio::test]
async fn test_sweep_catches_transition_deferred_by_index_outage() {
    let h = harness();
    let s = &h.scheduler;
    s.on_report(report(50.0, 0)).await.unwrap();

    h.index.available.store(false, Ordering::Relaxed);
    assert!(s.on_report(report(5.0, 30)).await.unwrap().is_empty());
    assert!(!s.store().get(SUBJECT, SITE).unwrap().inside);

    h.index.available.store(true, Ordering::Relaxed);
    let stats = s.sweep().await;
    assert_eq!(stats.evaluated, 1);
    assert_eq!(stats.events, 1);
    assert!(s.store().get(SUBJECT, SITE).unwrap().inside);

    // A second sweep over the same report changes nothing
    let again = s.sweep().await;
    assert_eq!(again.events, 0);
}

#[tokio::test]
async fn test_sweep_defers_when_index_unavailable() {
    let h = harness();
    let s = &h.scheduler;
    s.on_report(report(50.0, 0)).await.unwrap();

    h.index.available.store(false, Ordering::Relaxed);
    let stats = s.sweep().await;
    assert_eq!(stats.deferred, 1);
    assert_eq!(stats.evaluated, 0);
}

#[tokio::test]
async fn test_sweep_subject_timeout_when_lock_held() {
    let h = harness_with_config(Config::default().with_sweep(30, 20, 900));
    let s = &h.scheduler;
    s.on_report(report(50.0, 0)).await.unwrap();

    let _held = s.locks.acquire(SUBJECT).await;
    let stats = s.sweep().await;
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.evaluated, 0);
}

#[tokio::test]
async fn test_sweep_reports_silent_subjects() {
    let h = harness_with_config(Config::default().with_sweep(30, 1000, 60));
    let s = &h.scheduler;

    let mut stale = report(50.0, 0);
    stale.reported_at = Utc::now() - chrono::Duration::seconds(600);
    s.on_report(stale).await.unwrap();
    assert_eq!(s.sweep().await.silent, 1);

    let mut fresh = report(50.0, 0);
    fresh.reported_at = Utc::now();
    s.on_report(fresh).await.unwrap();
    assert_eq!(s.sweep().await.silent, 0);
}

#[tokio::test]
async fn test_subjects_without_reports_are_not_swept() {
    let h = harness();
    let stats = h.scheduler.sweep().await;
    assert_eq!(stats, SweepStats::default());
}

#[tokio::test]
async fn test_journal_failure_leaves_transition_for_sweep() {
    let dir = tempdir().unwrap();
    let journal_dir = dir.path().join("journal");
    let events = Arc::new(EventLog::open(journal_dir.join("events.jsonl")).await.unwrap());
    let h = harness_with_events(Config::default().with_gap_fill(120, 100.0, 10), events);
    let s = &h.scheduler;
    s.on_report(report(50.0, 0)).await.unwrap();

    // A plain file where the journal directory should be makes every append fail
    std::fs::write(&journal_dir, b"").unwrap();
    let entered = s.on_report(report(10.0, 30)).await.unwrap();
    assert!(entered.is_empty());
    assert!(!s.store().get(SUBJECT, SITE).unwrap().inside);
    assert!(s.events().is_empty());
    assert_eq!(s.reports().latest(SUBJECT).unwrap().reported_at, at(30));

    std::fs::remove_file(&journal_dir).unwrap();
    let stats = s.sweep().await;
    assert_eq!(stats.events, 1);
    assert_eq!(kinds(&s.events().all()), vec![TransitionKind::Enter]);
    assert!(s.store().get(SUBJECT, SITE).unwrap().inside);

    let reopened = EventLog::open(journal_dir.join("events.jsonl")).await.unwrap();
    assert_eq!(reopened.pending_count(), 1);
}

#[tokio::test]
async fn test_delivered_backlog_keeps_enter_exit_alternating() {
    let h = harness();
    let s = &h.scheduler;

    s.on_report(report(50.0, 0)).await.unwrap();
    s.on_report(report(10.0, 30)).await.unwrap();
    s.on_report(report(50.0, 60)).await.unwrap();
    // Re-entry while the first enter is still pending
    assert!(s.on_report(report(10.0, 90)).await.unwrap().is_empty());

    for event in s.events().pending() {
        let settled = h.dispatcher.deliver(event.id).await.unwrap();
        assert_eq!(settled.status, DeliveryStatus::Sent);
    }

    // Leaving again cancels out the re-entry that was never stored
    assert!(s.on_report(report(50.0, 120)).await.unwrap().is_empty());
    assert_eq!(
        kinds(&s.events().events_for(SUBJECT, SITE)),
        vec![TransitionKind::Enter, TransitionKind::Exit]
    );

    let entered = s.on_report(report(10.0, 150)).await.unwrap();
    assert_eq!(kinds(&entered), vec![TransitionKind::Enter]);
    assert_eq!(
        kinds(&s.events().events_for(SUBJECT, SITE)),
        vec![TransitionKind::Enter, TransitionKind::Exit, TransitionKind::Enter]
    );
}

#[tokio::test]
async fn test_reports_away_from_all_sites_keep_subject_fresh() {
    let h = harness_with_config(Config::default().with_sweep(30, 1000, 60));
    let s = &h.scheduler;

    let mut near = report(50.0, 0);
    near.reported_at = Utc::now() - chrono::Duration::hours(2);
    s.on_report(near).await.unwrap();

    let mut far = report(20_000.0, 0);
    far.reported_at = Utc::now();
    s.on_report(far).await.unwrap();
    assert_eq!(s.sweep().await.silent, 0);
}

#[tokio::test]
async fn test_subject_never_near_a_site_can_go_silent() {
    let h = harness_with_config(Config::default().with_sweep(30, 1000, 60));
    let s = &h.scheduler;

    let mut far = report(20_000.0, 0);
    far.reported_at = Utc::now() - chrono::Duration::seconds(600);
    s.on_report(far).await.unwrap();
    assert!(s.store().get(SUBJECT, SITE).is_none());
    assert_eq!(s.sweep().await.silent, 1);
}
