use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tree_mirror_core::config::{DepthScheme, MirrorConfig, RetryPolicy, RootFilter};
use tree_mirror_core::contract::{
    Ack, ChunkPoster, DestinationHandle, DestinationKind, DestinationRequest, DestinationResolver,
    ExistenceRecord, MockChunkPoster, MockDestinationResolver, MockTreeFetcher, PathEntry,
    TreeSource,
};
use tree_mirror_core::error::{CollaboratorError, FetchError, MirrorError, Warning};
use tree_mirror_core::mirror::{mirror_entries, run_mirror, DestinationOutcome};

const BASE: &str = "https://github.com/org/notes/blob/main";

fn config(depth: DepthScheme) -> MirrorConfig {
    let mut config = MirrorConfig::new(RootFilter::new("archive/"), BASE, depth);
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 0,
    };
    config
}

fn source() -> TreeSource {
    TreeSource {
        owner: "org".to_string(),
        repo: "notes".to_string(),
        branch: "main".to_string(),
    }
}

/// Resolves everything as newly created and records every post.
#[derive(Default)]
struct Recorder {
    resolves: Mutex<Vec<DestinationRequest>>,
    posts: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    fn posts_to(&self, handle: &str) -> Vec<String> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == handle)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl DestinationResolver for Recorder {
    async fn resolve(&self, request: &DestinationRequest) -> Result<ExistenceRecord, CollaboratorError> {
        self.resolves.lock().unwrap().push(request.clone());
        Ok(ExistenceRecord {
            key: request.key.clone(),
            already_exists: false,
            handle: DestinationHandle(format!("h:{}", request.key)),
        })
    }
}

#[async_trait]
impl ChunkPoster for Recorder {
    async fn post_chunk(&self, handle: &DestinationHandle, text: &str) -> Result<Ack, CollaboratorError> {
        self.posts
            .lock()
            .unwrap()
            .push((handle.0.clone(), text.to_string()));
        Ok(Ack::default())
    }
}

#[tokio::test]
async fn one_channel_two_sorted_links_one_chunk() {
    let entries = vec![
        PathEntry::file("archive/Math/hw2.pdf"),
        PathEntry::file("archive/Math/hw1.pdf"),
    ];
    let recorder = Recorder::default();

    let report = mirror_entries(
        &entries,
        &config(DepthScheme::Channel),
        &recorder,
        &recorder,
        &CancellationToken::new(),
    )
    .await
    .expect("mirror should succeed");

    assert_eq!(report.destinations.len(), 1);
    let math = report.destination("Math").expect("Math destination");
    assert_eq!(math.outcome, DestinationOutcome::Complete);
    assert_eq!(math.created, Some(true));
    assert_eq!(math.total_chunks, 1);

    let posts = recorder.posts_to("h:Math");
    assert_eq!(
        posts,
        vec![format!(
            "* [hw1.pdf](<{BASE}/archive/Math/hw1.pdf>)\n* [hw2.pdf](<{BASE}/archive/Math/hw2.pdf>)\n"
        )]
    );
}

#[tokio::test]
async fn thread_destination_posts_under_its_channel() {
    let entries = vec![
        PathEntry::file("archive/CS/Labs/lab1.py"),
        PathEntry::file("archive/CS/Labs/lab2.py"),
    ];
    let recorder = Recorder::default();

    let report = mirror_entries(
        &entries,
        &config(DepthScheme::ChannelAndThread),
        &recorder,
        &recorder,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let keys: Vec<&str> = report.destinations.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, vec!["CS/Labs"]);
    assert_eq!(report.destinations[0].kind, DestinationKind::Thread);

    let resolves = recorder.resolves.lock().unwrap().clone();
    assert_eq!(resolves.len(), 2, "channel then thread");
    assert_eq!(resolves[0].key, "CS");
    assert_eq!(resolves[0].kind_hint, DestinationKind::Channel);
    assert_eq!(resolves[1].key, "CS/Labs");
    assert_eq!(resolves[1].display_name, "Labs");
    assert_eq!(resolves[1].parent, Some(DestinationHandle("h:CS".to_string())));

    assert!(recorder.posts_to("h:CS").is_empty(), "nothing leaks into the channel");
    let thread_posts = recorder.posts_to("h:CS/Labs").concat();
    assert!(thread_posts.contains("lab1.py"));
    assert!(thread_posts.contains("lab2.py"));
}

#[tokio::test]
async fn channel_is_resolved_once_for_all_its_threads() {
    let entries = vec![
        PathEntry::file("archive/CS/intro.md"),
        PathEntry::file("archive/CS/Labs/lab1.py"),
        PathEntry::file("archive/CS/Exams/final.pdf"),
    ];
    let recorder = Recorder::default();

    let report = mirror_entries(
        &entries,
        &config(DepthScheme::ChannelAndThread),
        &recorder,
        &recorder,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.destinations.len(), 3);
    let channel_resolves = recorder
        .resolves
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.kind_hint == DestinationKind::Channel)
        .count();
    assert_eq!(channel_resolves, 1);
    assert_eq!(recorder.posts_to("h:CS").concat().matches("intro.md").count(), 1);
}

#[tokio::test]
async fn every_file_appears_in_exactly_one_destination() {
    let files = [
        "archive/README.md",
        "archive/Math/hw1.pdf",
        "archive/Math/old/hw0.pdf",
        "archive/CS/intro.md",
        "archive/CS/Labs/lab1.py",
        "archive/CS/Labs/deep/nested/x.py",
    ];
    let mut entries: Vec<PathEntry> = files.iter().map(|f| PathEntry::file(*f)).collect();
    entries.push(PathEntry::file("docs/outside.md"));

    for depth in [DepthScheme::Channel, DepthScheme::ChannelAndThread] {
        let recorder = Recorder::default();
        mirror_entries(&entries, &config(depth), &recorder, &recorder, &CancellationToken::new())
            .await
            .unwrap();
        let all_posts: String = recorder
            .posts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect();
        for file in files {
            let link = format!("(<{BASE}/{file}>)");
            assert_eq!(all_posts.matches(&link).count(), 1, "{file} with {depth:?}");
        }
        assert!(!all_posts.contains("outside.md"));
    }
}

#[tokio::test]
async fn reruns_post_identical_chunks() {
    let entries: Vec<PathEntry> = (0..200)
        .map(|i| PathEntry::file(format!("archive/Math/problem-set-{i:03}.pdf")))
        .collect();
    let mut config = config(DepthScheme::Channel);
    config.max_chunk_size = 500;

    let first = Recorder::default();
    mirror_entries(&entries, &config, &first, &first, &CancellationToken::new())
        .await
        .unwrap();
    let mut reversed = entries.clone();
    reversed.reverse();
    let second = Recorder::default();
    mirror_entries(&reversed, &config, &second, &second, &CancellationToken::new())
        .await
        .unwrap();

    let first_posts = first.posts_to("h:Math");
    assert!(first_posts.len() > 1);
    assert_eq!(first_posts, second.posts_to("h:Math"));
    assert!(first_posts.iter().all(|c| c.chars().count() <= 500));
}

#[tokio::test]
async fn oversized_line_is_posted_whole_and_reported() {
    let long_name = format!("{}.pdf", "x".repeat(300));
    let entries = vec![PathEntry::file(format!("archive/Math/{long_name}"))];
    let mut config = config(DepthScheme::Channel);
    config.max_chunk_size = 100;
    let recorder = Recorder::default();

    let report = mirror_entries(&entries, &config, &recorder, &recorder, &CancellationToken::new())
        .await
        .unwrap();

    let posts = recorder.posts_to("h:Math");
    assert_eq!(posts.len(), 1);
    assert!(posts[0].contains(&long_name));
    assert!(matches!(
        report.warnings.as_slice(),
        [Warning::OversizedLine { destination, max_size: 100, .. }] if destination == "Math"
    ));
}

#[tokio::test]
async fn collision_warning_is_reported() {
    let entries = vec![
        PathEntry::file("archive/Math"),
        PathEntry::file("archive/Math/hw1.pdf"),
    ];
    let recorder = Recorder::default();

    let report = mirror_entries(
        &entries,
        &config(DepthScheme::Channel),
        &recorder,
        &recorder,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(matches!(report.warnings.as_slice(), [Warning::Collision { path, .. }] if path == "archive/Math"));
    assert!(report.to_string().contains("archive/Math: file replaced by directory"));
}

#[tokio::test]
async fn failed_channel_does_not_abort_other_channels() {
    let entries = vec![
        PathEntry::file("archive/Bio/cells.pdf"),
        PathEntry::file("archive/Math/hw1.pdf"),
    ];
    let mut resolver = MockDestinationResolver::new();
    resolver.expect_resolve().returning(|req: &DestinationRequest| {
        if req.key == "Bio" {
            Err("missing permissions".into())
        } else {
            Ok(ExistenceRecord {
                key: req.key.clone(),
                already_exists: true,
                handle: DestinationHandle("42".to_string()),
            })
        }
    });
    let mut poster = MockChunkPoster::new();
    poster
        .expect_post_chunk()
        .times(1)
        .returning(|handle: &DestinationHandle, _text: &str| {
            assert_eq!(handle.0, "42");
            Ok(Ack {
                message_id: Some("m1".to_string()),
            })
        });

    let report = mirror_entries(
        &entries,
        &config(DepthScheme::Channel),
        &resolver,
        &poster,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let bio = report.destination("Bio").unwrap();
    assert_eq!(bio.outcome, DestinationOutcome::ResolveFailed);
    assert!(bio.error.as_deref().unwrap().contains("missing permissions"));
    let math = report.destination("Math").unwrap();
    assert_eq!(math.outcome, DestinationOutcome::Complete);
    assert_eq!(math.created, Some(false));
    assert!(report.has_failures());
}

#[tokio::test]
async fn failed_chunk_is_reported_and_later_chunks_still_posted() {
    let entries: Vec<PathEntry> = (0..3)
        .map(|i| PathEntry::file(format!("archive/Math/{i}.pdf")))
        .collect();
    let mut config = config(DepthScheme::Channel);
    config.max_chunk_size = 80;
    config.retry.max_attempts = 2;

    let mut resolver = MockDestinationResolver::new();
    resolver.expect_resolve().returning(|req: &DestinationRequest| {
        Ok(ExistenceRecord {
            key: req.key.clone(),
            already_exists: false,
            handle: DestinationHandle("c".to_string()),
        })
    });
    let posted = Arc::new(Mutex::new(Vec::new()));
    let sink = posted.clone();
    let mut poster = MockChunkPoster::new();
    poster
        .expect_post_chunk()
        .returning(move |_handle: &DestinationHandle, text: &str| {
            if text.contains("1.pdf") {
                return Err("rate limited".into());
            }
            sink.lock().unwrap().push(text.to_string());
            Ok(Ack::default())
        });

    let report = mirror_entries(&entries, &config, &resolver, &poster, &CancellationToken::new())
        .await
        .unwrap();

    let math = report.destination("Math").unwrap();
    assert_eq!(math.total_chunks, 3);
    assert_eq!(math.outcome, DestinationOutcome::Partial);
    assert_eq!(math.failed_chunks, vec![1]);
    assert_eq!(math.posted_chunks, 2);
    let posted = posted.lock().unwrap();
    assert!(posted[0].contains("0.pdf"));
    assert!(posted[1].contains("2.pdf"));
    assert!(report.to_string().contains("failed chunks [1] of 3"));
}

#[tokio::test]
async fn transient_post_failure_is_retried() {
    let entries = vec![PathEntry::file("archive/Math/hw1.pdf")];
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    let recorder = Recorder::default();
    let mut poster = MockChunkPoster::new();
    poster
        .expect_post_chunk()
        .times(2)
        .returning(move |_handle: &DestinationHandle, _text: &str| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("503".into())
            } else {
                Ok(Ack::default())
            }
        });

    let report = mirror_entries(
        &entries,
        &config(DepthScheme::Channel),
        &recorder,
        &poster,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.destination("Math").unwrap().outcome, DestinationOutcome::Complete);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retries_stop_after_max_attempts() {
    let entries = vec![PathEntry::file("archive/Math/hw1.pdf")];
    let recorder = Recorder::default();
    let mut poster = MockChunkPoster::new();
    poster
        .expect_post_chunk()
        .times(3)
        .returning(|_handle: &DestinationHandle, _text: &str| Err("down".into()));

    let report = mirror_entries(
        &entries,
        &config(DepthScheme::Channel),
        &recorder,
        &poster,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.destination("Math").unwrap().failed_chunks, vec![0]);
}

/// Cancels the run once the first chunk has been posted.
struct CancelAfterFirst {
    cancel: CancellationToken,
    posts: AtomicUsize,
}

#[async_trait]
impl ChunkPoster for CancelAfterFirst {
    async fn post_chunk(&self, _handle: &DestinationHandle, _text: &str) -> Result<Ack, CollaboratorError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        Ok(Ack::default())
    }
}

#[tokio::test]
async fn cancellation_stops_further_chunks_of_a_destination() {
    let entries: Vec<PathEntry> = (0..3)
        .map(|i| PathEntry::file(format!("archive/Math/{i}.pdf")))
        .collect();
    let mut config = config(DepthScheme::Channel);
    config.max_chunk_size = 80;
    let cancel = CancellationToken::new();
    let poster = CancelAfterFirst {
        cancel: cancel.clone(),
        posts: AtomicUsize::new(0),
    };
    let recorder = Recorder::default();

    let report = mirror_entries(&entries, &config, &recorder, &poster, &cancel)
        .await
        .unwrap();

    assert_eq!(poster.posts.load(Ordering::SeqCst), 1);
    let math = report.destination("Math").unwrap();
    assert_eq!(math.outcome, DestinationOutcome::Cancelled);
    assert_eq!(math.posted_chunks, 1);
    assert_eq!(math.total_chunks, 3);
    assert!(report.to_string().contains("cancelled Math: 1/3 chunks posted"));
}

#[tokio::test]
async fn cancelled_run_touches_nothing() {
    let entries = vec![PathEntry::file("archive/Math/hw1.pdf")];
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut resolver = MockDestinationResolver::new();
    resolver.expect_resolve().never();
    let mut poster = MockChunkPoster::new();
    poster.expect_post_chunk().never();

    let report = mirror_entries(&entries, &config(DepthScheme::Channel), &resolver, &poster, &cancel)
        .await
        .unwrap();

    assert_eq!(report.cancelled().count(), 1);
}

/// Fails every post and counts the attempts.
#[derive(Default)]
struct FailingPoster {
    attempts: AtomicUsize,
}

#[async_trait]
impl ChunkPoster for FailingPoster {
    async fn post_chunk(&self, _handle: &DestinationHandle, _text: &str) -> Result<Ack, CollaboratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err("gateway timeout".into())
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_retries() {
    let entries = vec![PathEntry::file("archive/Math/hw1.pdf")];
    let mut config = config(DepthScheme::Channel);
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1000,
    };
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let recorder = Recorder::default();
    let poster = FailingPoster::default();
    let started = tokio::time::Instant::now();

    let report = mirror_entries(&entries, &config, &recorder, &poster, &cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(poster.attempts.load(Ordering::SeqCst), 1);
    let math = report.destination("Math").unwrap();
    assert_eq!(math.outcome, DestinationOutcome::Cancelled);
    assert_eq!(math.posted_chunks, 0);
    assert_eq!(math.failed_chunks, vec![0]);
}

/// Cancels the run, then holds its permit for a while.
struct CancelWhilePosting {
    cancel: CancellationToken,
    posts: AtomicUsize,
}

#[async_trait]
impl ChunkPoster for CancelWhilePosting {
    async fn post_chunk(&self, _handle: &DestinationHandle, _text: &str) -> Result<Ack, CollaboratorError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(Ack::default())
    }
}

#[tokio::test]
async fn call_waiting_for_a_permit_is_dropped_on_cancel() {
    let entries = vec![
        PathEntry::file("archive/A/a.pdf"),
        PathEntry::file("archive/B/b.pdf"),
    ];
    let mut config = config(DepthScheme::Channel);
    config.max_concurrent_calls = 1;
    let cancel = CancellationToken::new();
    let poster = CancelWhilePosting {
        cancel: cancel.clone(),
        posts: AtomicUsize::new(0),
    };
    let recorder = Recorder::default();

    let report = mirror_entries(&entries, &config, &recorder, &poster, &cancel)
        .await
        .unwrap();

    assert_eq!(poster.posts.load(Ordering::SeqCst), 1);
    let resolved: Vec<String> = recorder
        .resolves
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.key.clone())
        .collect();
    assert_eq!(resolved, vec!["A"]);
    assert_eq!(report.destination("A").unwrap().outcome, DestinationOutcome::Complete);
    let b = report.destination("B").unwrap();
    assert_eq!(b.outcome, DestinationOutcome::Cancelled);
    assert_eq!(b.created, None);
}

/// Tracks how many posts are in flight at once.
#[derive(Default)]
struct SlowPoster {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    order: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChunkPoster for SlowPoster {
    async fn post_chunk(&self, handle: &DestinationHandle, text: &str) -> Result<Ack, CollaboratorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.order
            .lock()
            .unwrap()
            .push((handle.0.clone(), text.to_string()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Ack::default())
    }
}

#[tokio::test]
async fn concurrency_cap_bounds_outstanding_calls_and_keeps_chunk_order() {
    let mut entries = Vec::new();
    for channel in ["A", "B", "C", "D", "E", "F"] {
        for i in 0..4 {
            entries.push(PathEntry::file(format!("archive/{channel}/{i}.pdf")));
        }
    }
    let mut config = config(DepthScheme::Channel);
    config.max_chunk_size = 80;
    config.max_concurrent_calls = 2;
    let recorder = Recorder::default();
    let poster = SlowPoster::default();

    let report = mirror_entries(&entries, &config, &recorder, &poster, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded().count(), 6);
    assert!(poster.peak.load(Ordering::SeqCst) <= 2);
    let order = poster.order.lock().unwrap();
    for channel in ["A", "B", "C", "D", "E", "F"] {
        let texts: Vec<&String> = order
            .iter()
            .filter(|(h, _)| h == &format!("h:{channel}"))
            .map(|(_, t)| t)
            .collect();
        assert_eq!(texts.len(), 4);
        for (i, text) in texts.iter().enumerate() {
            assert!(text.contains(&format!("/{i}.pdf")), "{channel} chunk {i} out of order");
        }
    }
}

#[tokio::test]
async fn fetch_failure_aborts_before_any_side_effect() {
    let mut fetcher = MockTreeFetcher::new();
    fetcher.expect_fetch_tree().returning(|_source: &TreeSource| {
        Err(FetchError::Status {
            status: 404,
            body: "Not Found".to_string(),
        })
    });
    let mut resolver = MockDestinationResolver::new();
    resolver.expect_resolve().never();
    let mut poster = MockChunkPoster::new();
    poster.expect_post_chunk().never();

    let err = run_mirror(
        &source(),
        &config(DepthScheme::Channel),
        &fetcher,
        &resolver,
        &poster,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, MirrorError::Fetch(FetchError::Status { status: 404, .. })));
}

#[tokio::test]
async fn run_mirror_uses_fetched_entries() {
    let mut fetcher = MockTreeFetcher::new();
    fetcher
        .expect_fetch_tree()
        .withf(|source: &TreeSource| source.repo == "notes")
        .returning(|_source: &TreeSource| Ok(vec![PathEntry::file("archive/Math/hw1.pdf")]));
    let recorder = Recorder::default();

    let report = run_mirror(
        &source(),
        &config(DepthScheme::Channel),
        &fetcher,
        &recorder,
        &recorder,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.succeeded().count(), 1);
}

#[tokio::test]
async fn invalid_config_is_fatal() {
    let mut config = config(DepthScheme::Channel);
    config.max_chunk_size = 0;
    let mut resolver = MockDestinationResolver::new();
    resolver.expect_resolve().never();
    let mut poster = MockChunkPoster::new();
    poster.expect_post_chunk().never();

    let err = mirror_entries(
        &[PathEntry::file("archive/Math/hw1.pdf")],
        &config,
        &resolver,
        &poster,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, MirrorError::Config(_)));
}
