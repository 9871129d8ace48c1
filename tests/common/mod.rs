use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_demo::{
    database::DatabaseError, AppConfig, DataStore, LifecycleState, PoolStats, Server, ServerError,
};
use reqwest::Client;
use tokio::task::JoinHandle;

/// In-memory data store whose availability can be switched at runtime
#[derive(Default)]
pub struct FakeStore {
    down: AtomicBool,
    pings: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataStore for FakeStore {
    async fn ping(&self) -> Result<(), DatabaseError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(DatabaseError::Sqlx(sqlx_io_error()));
        }
        Ok(())
    }

    async fn select_true(&self) -> Result<bool, DatabaseError> {
        Ok(true)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            open: 2,
            idle: 1,
            in_use: 1,
            max_open: 20,
            wait_count: 0,
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn sqlx_io_error() -> sqlx::Error {
    sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

pub struct TestEnvironment {
    pub client: Client,
    pub base_url: String,
    pub server: Arc<Server>,
    pub store: Arc<FakeStore>,
    serving: JoinHandle<Result<(), ServerError>>,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        Self::with_vars(&[]).await
    }

    pub async fn with_vars(vars: &[(&str, &str)]) -> Self {
        let mut all: HashMap<String, String> = HashMap::from([
            ("SERVICE_NAME".to_string(), "k8s-demo-test".to_string()),
            ("SERVICE_VERSION".to_string(), "v9.9.9".to_string()),
            ("SERVER_API_HOST".to_string(), "127.0.0.1:0".to_string()),
            ("SERVER_WRITE_TIMEOUT".to_string(), "2s".to_string()),
            ("SERVER_SHUTDOWN_TIMEOUT".to_string(), "5s".to_string()),
        ]);
        all.extend(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let config = Arc::new(AppConfig::from_vars(all));

        let store = Arc::new(FakeStore::default());
        let server = Arc::new(
            Server::with_store(config, store.clone())
                .await
                .expect("Failed to build server"),
        );
        let base_url = format!("http://{}", server.local_addr());

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        for _ in 0..100 {
            if server.state() == LifecycleState::Serving {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Self {
            client: Client::new(),
            base_url,
            server,
            store,
            serving,
        }
    }

    pub async fn stop(self) -> Result<(), ServerError> {
        self.server.shutdown().await?;
        self.serving.await.expect("Serving task panicked")
    }
}
