use super::*;
use std::sync::atomic::AtomicUsize;
use tokio::sync::{Notify, Semaphore};

type Behaviour = Box<dyn Fn(&str) -> Result<f64, ScoringError> + Send + Sync>;

struct FakeClient {
    behaviour: Behaviour,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    started: mpsc::UnboundedSender<String>,
    calls: AtomicUsize,
}

#[async_trait]
impl ScoringClient for FakeClient {
    async fn score_audio(&self, audio_url: &str, _song_id: &str) -> Result<f64, ScoringError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.send(audio_url.to_string());
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.map_err(|_| ScoringError::Closed)?;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.behaviour)(audio_url)
    }
}

struct Harness {
    client: Arc<FakeClient>,
    started: mpsc::UnboundedReceiver<String>,
}

fn fake(
    behaviour: impl Fn(&str) -> Result<f64, ScoringError> + Send + Sync + 'static,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
) -> Harness {
    let (started_tx, started) = mpsc::unbounded_channel();
    Harness {
        client: Arc::new(FakeClient {
            behaviour: Box::new(behaviour),
            delay,
            gate,
            started: started_tx,
            calls: AtomicUsize::new(0),
        }),
        started,
    }
}

impl Harness {
    async fn wait_started(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.started.recv())
            .await
            .expect("scoring call should start")
            .expect("client alive")
    }
}

#[derive(Default)]
struct RecordingSink {
    ready: Mutex<Vec<(ChallengeId, PlayerId, f64)>>,
    failed: Mutex<Vec<(ChallengeId, PlayerId, String)>>,
    notify: Notify,
}

#[async_trait]
impl ScoreSink for RecordingSink {
    async fn score_ready(&self, challenge_id: &ChallengeId, player_id: &PlayerId, score: f64) {
        self.ready
            .lock()
            .await
            .push((challenge_id.clone(), player_id.clone(), score));
        self.notify.notify_one();
    }

    async fn score_failed(
        &self,
        _key: CorrelationKey,
        challenge_id: &ChallengeId,
        player_id: &PlayerId,
        error: &ScoringError,
    ) {
        self.failed
            .lock()
            .await
            .push((challenge_id.clone(), player_id.clone(), error.to_string()));
        self.notify.notify_one();
    }
}

impl RecordingSink {
    async fn outcomes(&self) -> usize {
        self.ready.lock().await.len() + self.failed.lock().await.len()
    }

    async fn wait_for(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.outcomes().await < expected {
                self.notify.notified().await;
            }
        })
        .await
        .expect("timed out waiting for scoring outcomes");
    }
}

fn config(worker_count: usize, queue_capacity: usize) -> CorrelatorConfig {
    CorrelatorConfig {
        worker_count,
        queue_capacity,
        call_timeout: Duration::from_secs(5),
    }
}

fn request(challenge: &str, player: &str, audio_url: &str) -> ScoringRequest {
    ScoringRequest {
        key: CorrelationKey::generate(),
        challenge_id: ChallengeId::from(challenge),
        player_id: PlayerId::from(player),
        audio_url: audio_url.to_string(),
        song_id: "song-1".to_string(),
    }
}

#[tokio::test]
async fn identical_audio_urls_are_routed_to_their_own_requests() {
    let gate = Arc::new(Semaphore::new(0));
    let mut harness = fake(|_| Ok(42.0), Duration::ZERO, Some(Arc::clone(&gate)));
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(harness.client.clone(), sink.clone(), config(2, 8));

    correlator
        .submit(request("c1", "p1", "https://cdn.example/same.wav"))
        .await
        .expect("first");
    correlator
        .submit(request("c1", "p2", "https://cdn.example/same.wav"))
        .await
        .expect("second");

    // Both calls are in flight at the same time before either answers.
    harness.wait_started().await;
    harness.wait_started().await;
    assert_eq!(correlator.stats().await.in_flight, 2);
    gate.add_permits(2);

    sink.wait_for(2).await;
    let mut ready = sink.ready.lock().await.clone();
    ready.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        ready,
        vec![
            (ChallengeId::from("c1"), PlayerId::from("p1"), 42.0),
            (ChallengeId::from("c1"), PlayerId::from("p2"), 42.0),
        ]
    );

    let stats = correlator.stats().await;
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.in_flight, 0);
    correlator.shutdown().await;
}

#[tokio::test]
async fn each_score_reaches_the_player_whose_recording_produced_it() {
    let harness = fake(
        |url| match url {
            "a.wav" => Ok(80.0),
            "b.wav" => Ok(60.0),
            other => Err(ScoringError::Remote(format!("unknown {other}"))),
        },
        Duration::from_millis(5),
        None,
    );
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(harness.client.clone(), sink.clone(), config(3, 8));

    correlator
        .submit(request("c1", "alice", "a.wav"))
        .await
        .expect("a");
    correlator
        .submit(request("c2", "bob", "b.wav"))
        .await
        .expect("b");

    sink.wait_for(2).await;
    let ready = sink.ready.lock().await.clone();
    assert!(ready.contains(&(ChallengeId::from("c1"), PlayerId::from("alice"), 80.0)));
    assert!(ready.contains(&(ChallengeId::from("c2"), PlayerId::from("bob"), 60.0)));
    correlator.shutdown().await;
}

#[tokio::test]
async fn timed_out_call_is_reported_as_failure_without_a_score() {
    let harness = fake(|_| Ok(99.0), Duration::from_millis(500), None);
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(
        harness.client.clone(),
        sink.clone(),
        CorrelatorConfig {
            worker_count: 1,
            queue_capacity: 4,
            call_timeout: Duration::from_millis(20),
        },
    );

    correlator
        .submit(request("c1", "p1", "slow.wav"))
        .await
        .expect("submit");
    sink.wait_for(1).await;

    assert!(sink.ready.lock().await.is_empty());
    let failed = sink.failed.lock().await.clone();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].1, PlayerId::from("p1"));
    assert!(failed[0].2.contains("timed out"), "{}", failed[0].2);

    let stats = correlator.stats().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(harness.client.calls.load(Ordering::SeqCst), 1);
    correlator.shutdown().await;
}

#[tokio::test]
async fn saturated_queue_rejects_with_queue_full() {
    let gate = Arc::new(Semaphore::new(0));
    let mut harness = fake(|_| Ok(50.0), Duration::ZERO, Some(Arc::clone(&gate)));
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(harness.client.clone(), sink.clone(), config(1, 1));

    correlator
        .submit(request("c1", "p1", "one.wav"))
        .await
        .expect("in flight");
    harness.wait_started().await;
    correlator
        .submit(request("c2", "p2", "two.wav"))
        .await
        .expect("queued");

    let err = correlator
        .submit(request("c3", "p3", "three.wav"))
        .await
        .expect_err("queue is full");
    assert!(matches!(err, ScoringError::QueueFull));
    assert_eq!(correlator.stats().await.rejected, 1);

    gate.add_permits(2);
    sink.wait_for(2).await;
    assert_eq!(sink.ready.lock().await.len(), 2);
    correlator.shutdown().await;
}

#[tokio::test]
async fn dropped_ticket_releases_its_slot() {
    let gate = Arc::new(Semaphore::new(0));
    let mut harness = fake(|_| Ok(1.0), Duration::ZERO, Some(Arc::clone(&gate)));
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(harness.client.clone(), sink.clone(), config(1, 1));

    correlator
        .submit(request("c1", "p1", "one.wav"))
        .await
        .expect("in flight");
    harness.wait_started().await;

    let ticket = correlator.reserve().expect("free slot");
    assert!(matches!(correlator.reserve(), Err(ScoringError::QueueFull)));
    drop(ticket);
    correlator.reserve().expect("slot released");

    gate.add_permits(1);
    sink.wait_for(1).await;
    correlator.shutdown().await;
}

#[tokio::test]
async fn duplicate_in_flight_key_is_rejected() {
    let gate = Arc::new(Semaphore::new(0));
    let harness = fake(|_| Ok(70.0), Duration::ZERO, Some(Arc::clone(&gate)));
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(harness.client.clone(), sink.clone(), config(1, 4));

    let first = request("c1", "p1", "take.wav");
    let mut retry = request("c1", "p1", "take.wav");
    retry.key = first.key;

    correlator.submit(first).await.expect("first");
    let err = correlator.submit(retry).await.expect_err("duplicate key");
    assert!(matches!(err, ScoringError::DuplicateKey(_)));

    gate.add_permits(1);
    sink.wait_for(1).await;
    assert_eq!(sink.ready.lock().await.len(), 1);
    assert_eq!(correlator.stats().await.submitted, 1);
    correlator.shutdown().await;
}

#[tokio::test]
async fn non_finite_score_is_treated_as_failure() {
    let harness = fake(|_| Ok(f64::NAN), Duration::ZERO, None);
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(harness.client.clone(), sink.clone(), config(1, 4));

    correlator
        .submit(request("c1", "p1", "nan.wav"))
        .await
        .expect("submit");
    sink.wait_for(1).await;

    assert!(sink.ready.lock().await.is_empty());
    assert!(sink.failed.lock().await[0].2.contains("non-finite"));
    correlator.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_in_flight_and_queued_requests() {
    let gate = Arc::new(Semaphore::new(0));
    let mut harness = fake(|_| Ok(10.0), Duration::ZERO, Some(gate));
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(harness.client.clone(), sink.clone(), config(1, 4));

    correlator
        .submit(request("c1", "p1", "stuck.wav"))
        .await
        .expect("in flight");
    harness.wait_started().await;
    correlator
        .submit(request("c2", "p2", "queued.wav"))
        .await
        .expect("queued");

    correlator.shutdown().await;

    assert!(sink.ready.lock().await.is_empty());
    let failed = sink.failed.lock().await.clone();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|(_, _, reason)| reason == "scoring cancelled"));
    assert_eq!(correlator.stats().await.in_flight, 0);

    let err = correlator
        .submit(request("c3", "p3", "late.wav"))
        .await
        .expect_err("closed");
    assert!(matches!(err, ScoringError::Closed));
}

#[tokio::test]
async fn ticket_reserved_before_shutdown_cannot_queue_afterwards() {
    let harness = fake(|_| Ok(10.0), Duration::ZERO, None);
    let sink = Arc::new(RecordingSink::default());
    let correlator = ScoringCorrelator::start(harness.client.clone(), sink.clone(), config(1, 4));

    let ticket = correlator.reserve().expect("slot before shutdown");
    correlator.shutdown().await;

    let err = ticket
        .dispatch(request("c1", "p1", "late.wav"))
        .expect_err("queue already drained");
    assert!(matches!(err, ScoringError::Closed));

    let stats = correlator.stats().await;
    assert_eq!(stats.submitted, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(harness.client.calls.load(Ordering::SeqCst), 0);
}
