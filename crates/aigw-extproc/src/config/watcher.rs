use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{Config, ConfigStore};

/// Polls the filter config file and swaps the shared snapshot on change.
/// A failed parse keeps the previous snapshot in place; the readiness signal
/// only flips to true after the first successful load.
pub struct Watcher {
	path: PathBuf,
	interval: Duration,
	store: Arc<ConfigStore>,
	ready_tx: watch::Sender<bool>,
	last_hash: Option<[u8; 32]>,
}

impl Watcher {
	pub fn new(
		path: PathBuf,
		interval: Duration,
		store: Arc<ConfigStore>,
	) -> (Self, watch::Receiver<bool>) {
		let (ready_tx, ready_rx) = watch::channel(false);
		(
			Self {
				path,
				interval,
				store,
				ready_tx,
				last_hash: None,
			},
			ready_rx,
		)
	}

	/// Loads once, synchronously. The launcher calls this at startup so a
	/// missing or invalid file is fatal rather than silently unhealthy.
	pub fn load_initial(&mut self) -> Result<(), super::Error> {
		let raw = std::fs::read(&self.path)
			.map_err(|e| super::Error::Read(self.path.display().to_string(), e))?;
		self.apply(&raw)?;
		Ok(())
	}

	pub async fn run(mut self) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			ticker.tick().await;
			let raw = match tokio::fs::read(&self.path).await {
				Ok(raw) => raw,
				Err(e) => {
					warn!(path = %self.path.display(), "failed to read config file: {e}");
					continue;
				},
			};
			let hash: [u8; 32] = Sha256::digest(&raw).into();
			if self.last_hash == Some(hash) {
				continue;
			}
			match self.apply(&raw) {
				Ok(()) => {},
				Err(e) => {
					// Keep serving the old snapshot.
					error!(path = %self.path.display(), "config reload failed: {e}");
				},
			}
		}
	}

	fn apply(&mut self, raw: &[u8]) -> Result<(), super::Error> {
		let cfg = Config::from_yaml(raw)?;
		info!(
			uuid = %cfg.uuid,
			backends = cfg.backends.len(),
			costs = cfg.llm_request_costs.len(),
			"loaded filter config"
		);
		self.last_hash = Some(Sha256::digest(raw).into());
		self.store.swap(Arc::new(cfg));
		let _ = self.ready_tx.send(true);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINIMAL: &str = "
modelNameHeaderKey: x-ai-eg-model
backends:
- name: openai
  schema:
    name: OpenAI
";

	#[tokio::test]
	async fn initial_load_flips_ready() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.yaml");
		std::fs::write(&path, MINIMAL).unwrap();

		let store = ConfigStore::new();
		let (mut w, ready) = Watcher::new(path, Duration::from_secs(1), store.clone());
		assert!(!*ready.borrow());
		w.load_initial().unwrap();
		assert!(*ready.borrow());
		assert!(store.loaded());
		assert_eq!(store.snapshot().unwrap().backends[0].name, "openai");
	}

	#[tokio::test]
	async fn bad_reload_keeps_old_snapshot() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.yaml");
		std::fs::write(&path, MINIMAL).unwrap();

		let store = ConfigStore::new();
		let (mut w, _ready) = Watcher::new(path.clone(), Duration::from_secs(1), store.clone());
		w.load_initial().unwrap();

		std::fs::write(&path, "{nonsense: [").unwrap();
		let raw = std::fs::read(&path).unwrap();
		assert!(w.apply(&raw).is_err());
		assert_eq!(store.snapshot().unwrap().backends.len(), 1);
	}

	#[test]
	fn missing_file_is_an_error() {
		let store = ConfigStore::new();
		let (mut w, _ready) = Watcher::new(
			PathBuf::from("/definitely/not/here.yaml"),
			Duration::from_secs(1),
			store,
		);
		assert!(w.load_initial().is_err());
	}
}
