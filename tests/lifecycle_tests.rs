use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remotethermo::{Engine, EngineConfig, HttpResponse, ParamValue, Result, Transport};
use serde_json::{json, Value};

/// In-memory device: remembers the last desired temperature it was sent and
/// counts concurrent requests.
#[derive(Default)]
struct Device {
    desired: Mutex<f64>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
}

impl Device {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            desired: Mutex::new(21.5),
            latency,
            ..Default::default()
        })
    }

    async fn exchange(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn main_body(&self) -> Value {
        let desired = *self.desired.lock().unwrap();
        json!({
            "mode": 1,
            "allowedModes": [0, 1, 5],
            "outsideTemp": 4.0,
            "zone": {
                "num": 1,
                "mode": {"value": 1, "allowedOptions": [0, 1, 2]},
                "desiredTemp": {"value": desired, "min": 10.0, "max": 30.0, "step": 0.5},
                "roomTemp": 20.0
            }
        })
    }
}

struct DeviceTransport(Arc<Device>);

impl Transport for DeviceTransport {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse> {
        self.0.exchange().await;
        self.0.gets.fetch_add(1, Ordering::SeqCst);
        let body = if url.contains("/PlantHomeSlp/GetData/") {
            self.0.main_body().to_string()
        } else {
            "{}".to_string()
        };
        Ok(HttpResponse {
            status: 200,
            url: url.to_string(),
            body,
        })
    }

    async fn post(&self, url: &str, _timeout: Duration, body: &Value) -> Result<HttpResponse> {
        self.0.exchange().await;
        if url.contains("/Account/Login") {
            return Ok(HttpResponse {
                status: 200,
                url: "http://device/R2/Plant/Index/PL9".to_string(),
                body: String::new(),
            });
        }
        self.0.sets.fetch_add(1, Ordering::SeqCst);
        if let Some(t) = body["NewValue"]["zone"]["desiredTemp"].as_f64() {
            *self.0.desired.lock().unwrap() = t;
        }
        Ok(HttpResponse {
            status: 200,
            url: url.to_string(),
            body: "{}".to_string(),
        })
    }

    fn reset(&self) {}
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::new("user@example.com", "secret");
    config.base_url = "http://device".to_string();
    config.enabled = Some(vec![
        "mode".into(),
        "ch_set_temperature".into(),
        "ch_detected_temperature".into(),
    ]);
    config
}

fn engine(device: &Arc<Device>) -> Engine<DeviceTransport> {
    Engine::builder(config(), DeviceTransport(Arc::clone(device)))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn loops_follow_poll_interval_and_stop() {
    let device = Device::new(Duration::ZERO);
    let engine = engine(&device);

    engine.start().await.unwrap();
    engine.start().await.unwrap();
    assert!(engine.is_running());

    tokio::time::sleep(Duration::from_secs(95)).await;
    // Ticks at 0s, 30s, 60s and 90s.
    assert_eq!(device.gets.load(Ordering::SeqCst), 4);
    assert!(engine.availability().available);

    engine.stop();
    engine.stop();
    assert!(!engine.is_running());
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(device.gets.load(Ordering::SeqCst), 4);

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(device.gets.load(Ordering::SeqCst), 5);
    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn dropping_the_engine_ends_its_loops() {
    let device = Device::new(Duration::ZERO);
    let engine = engine(&device);
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(device.gets.load(Ordering::SeqCst), 1);

    drop(engine);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(device.gets.load(Ordering::SeqCst), 1);
    assert_eq!(device.sets.load(Ordering::SeqCst), 0);
    // The transport went away with the engine.
    assert_eq!(Arc::strong_count(&device), 1);
}

#[tokio::test(start_paused = true)]
async fn write_loop_debounces_and_confirms() {
    let device = Device::new(Duration::ZERO);
    let engine = engine(&device);
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    engine
        .request_changes([("ch_set_temperature", 23.0)])
        .await
        .unwrap();
    engine
        .request_changes([("ch_set_temperature", 23.5)])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(device.sets.load(Ordering::SeqCst), 0, "still debouncing");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(device.sets.load(Ordering::SeqCst), 1, "one batched set");
    assert_eq!(*device.desired.lock().unwrap(), 23.5);
    assert!(engine.availability().setting_in_progress);

    // The next scheduled tick reads Main and confirms.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(engine.pending_writes().is_empty());
    assert!(!engine.availability().setting_in_progress);
    assert_eq!(
        engine.sensor_value("ch_set_temperature").unwrap().value,
        Some(ParamValue::Number(23.5))
    );
    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn status_listener_sees_availability_flip() {
    let device = Device::new(Duration::ZERO);
    let engine = engine(&device);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = engine.subscribe(
        |_| {},
        move |change| sink.lock().unwrap().push(change.current.available),
    );

    engine.poll_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*seen.lock().unwrap(), vec![true]);

    assert!(engine.unsubscribe(id));
    assert!(!engine.unsubscribe(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_request_in_flight() {
    let device = Device::new(Duration::from_millis(2));
    let engine = engine(&device);
    engine.poll_once().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..4 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                engine.poll_once().await.unwrap();
            }
            i
        }));
    }
    for i in 0..4 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..5 {
                let target = 15.0 + f64::from(i * 5 + n) * 0.5;
                let _ = engine
                    .request_changes([("ch_set_temperature", target)])
                    .await;
                engine.reconcile_once().await.unwrap();
            }
            i
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(device.sets.load(Ordering::SeqCst) > 0);
    assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
}
