use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use folio_core::{Clock, ManualClock, UserId};
use folio_infra::cache::CacheKey;
use folio_infra::config::{CacheConfig, FolioConfig};
use folio_infra::jobs::{InMemoryPagePublisher, InMemoryPreviewStore, TickReport};
use folio_server::{AdminService, Backends, Services};

struct Cluster {
    clock: ManualClock,
    backends: Backends,
    pages: Arc<InMemoryPagePublisher>,
    previews: Arc<InMemoryPreviewStore>,
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-04T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn config(instance: &str) -> FolioConfig {
    let mut config = FolioConfig::default();
    config.cache = CacheConfig::Memory;
    config.instance.id = Some(instance.to_string());
    config
}

/// Backends shared by every simulated instance.
fn cluster() -> Cluster {
    let clock = ManualClock::new(t0());
    let pages = Arc::new(InMemoryPagePublisher::new());
    let previews = Arc::new(InMemoryPreviewStore::new());
    let mut backends = Backends::in_memory(Arc::new(clock.clone()));
    backends.pages = pages.clone();
    backends.previews = previews.clone();
    Cluster {
        clock,
        backends,
        pages,
        previews,
    }
}

fn instance(cluster: &Cluster, id: &str) -> Services {
    Services::assemble(&config(id), cluster.backends.clone()).unwrap()
}

fn tick_concurrently(instances: &[&Services]) -> Vec<TickReport> {
    thread::scope(|scope| {
        let handles: Vec<_> = instances
            .iter()
            .map(|services| scope.spawn(move || services.dispatcher.tick()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn succeeded(reports: &[TickReport]) -> usize {
    reports.iter().map(TickReport::succeeded).sum()
}

#[test]
fn two_instances_run_each_due_job_exactly_once() {
    let cluster = cluster();
    let web1 = instance(&cluster, "web-1");
    let web2 = instance(&cluster, "web-2");

    let first = tick_concurrently(&[&web1, &web2]);
    assert_eq!(succeeded(&first), 3);

    // Only publish-pages (60s) is due again; the cleanup jobs run hourly.
    cluster.clock.advance(Duration::from_secs(61));
    let second = tick_concurrently(&[&web1, &web2]);
    assert_eq!(succeeded(&second), 1);
    let run = second.iter().flat_map(|r| &r.runs).next().unwrap();
    assert_eq!(run.job_name, "publish-pages");

    let status = AdminService::new(&web1).job_status().unwrap();
    let counts: Vec<_> = status
        .iter()
        .map(|job| (job.name.as_str(), job.record.as_ref().unwrap().run_count))
        .collect();
    assert_eq!(
        counts,
        [
            ("clean-expired-previews", 1),
            ("clean-expired-tokens", 1),
            ("publish-pages", 2)
        ]
    );
}

#[test]
fn scheduled_page_is_published_and_its_cache_dropped() {
    let cluster = cluster();
    let web1 = instance(&cluster, "web-1");
    cluster.pages.schedule("42", "/launch", t0() + chrono::Duration::seconds(30));
    let launch = CacheKey::page("/launch", "en", "default").unwrap();
    let other = CacheKey::page("/pricing", "en", "default").unwrap();
    web1.cache.set(&launch, b"<p>coming soon</p>", None).unwrap();
    web1.cache.set(&other, b"<p>pricing</p>", None).unwrap();

    web1.dispatcher.tick();
    assert!(!cluster.pages.is_public("/launch"));
    assert!(web1.cache.get(&launch).unwrap().is_some());

    cluster.clock.advance(Duration::from_secs(61));
    web1.dispatcher.tick();

    assert!(cluster.pages.is_public("/launch"));
    assert!(web1.cache.get(&launch).unwrap().is_none());
    assert!(web1.cache.get(&other).unwrap().is_some());
}

#[test]
fn process_job_runs_outside_the_schedule() {
    let cluster = cluster();
    let web1 = instance(&cluster, "web-1");
    let admin = AdminService::new(&web1);
    web1.dispatcher.tick();

    cluster.previews.insert("draft-1", cluster.clock.now());
    cluster.clock.advance(Duration::from_secs(5));
    let report = admin.process_job("clean-expired-previews").unwrap();

    assert!(report.outcome.is_success());
    assert!(cluster.previews.ids().is_empty());
    let record = admin
        .job_status()
        .unwrap()
        .into_iter()
        .find(|j| j.name == "clean-expired-previews")
        .and_then(|j| j.record)
        .unwrap();
    assert_eq!(record.run_count, 2);
}

#[test]
fn process_job_rejects_unknown_and_disabled_jobs() {
    let cluster = cluster();
    let mut cfg = config("web-1");
    cfg.jobs.clean_expired_tokens.enabled = false;
    let web1 = Services::assemble(&cfg, cluster.backends.clone()).unwrap();
    let admin = AdminService::new(&web1);

    let unknown = admin.process_job("rebuild-search-index").unwrap_err();
    assert_eq!(unknown.status_code(), 404);

    let disabled = admin.process_job("clean-expired-tokens").unwrap_err();
    assert_eq!(disabled.status_code(), 409);
    assert_eq!(disabled.code(), "job_disabled");
}

#[test]
fn clear_cache_is_visible_to_every_instance_sharing_the_backend() {
    let cluster = cluster();
    let web1 = instance(&cluster, "web-1");
    let web2 = instance(&cluster, "web-2");
    let key = CacheKey::query("articles", "latest").unwrap();
    web2.cache.set(&key, b"[]", None).unwrap();

    let report = AdminService::new(&web1).clear_cache().unwrap();

    assert_eq!(report.removed, 1);
    assert!(web2.cache.get(&key).unwrap().is_none());
}

#[test]
fn invalidate_rejects_unknown_scopes() {
    let cluster = cluster();
    let admin = AdminService::new(&instance(&cluster, "web-1"));

    let err = admin.invalidate("everything", None).unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(admin.invalidate("page", Some("/about")).is_ok());
}

#[test]
fn session_lifecycle_through_admin_facade() {
    let cluster = cluster();
    let web1 = instance(&cluster, "web-1");
    let web2 = instance(&cluster, "web-2");
    let admin1 = AdminService::new(&web1);
    let admin2 = AdminService::new(&web2);

    let token = admin1.login(UserId::new(), false).unwrap();
    assert_eq!(admin2.authenticate(token.token_id).unwrap().user_id, token.user_id);

    cluster.clock.advance(Duration::from_secs(3600));
    let renewed = admin2.renew(token.token_id).unwrap();
    assert!(renewed.expires_at > token.expires_at);

    assert!(admin1.logout(token.token_id).unwrap());
    let err = admin2.authenticate(token.token_id).unwrap_err();
    assert_eq!((err.status_code(), err.code()), (401, "token_revoked"));
    let err = admin2.renew(token.token_id).unwrap_err();
    assert_eq!((err.status_code(), err.code()), (403, "token_not_renewable"));
}
