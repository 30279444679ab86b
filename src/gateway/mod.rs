//! Model Gateway
//!
//! Recognizer/Translator/Synthesizer capability contracts, deterministic
//! stub adapters, and a lazy-loading registry. Deliberately not a
//! module-level global like the source tree's `TTSRegistry`: instances live
//! on `AppContext` and are passed by `Arc`, so tests and multiple relay
//! instances never share hidden state.

pub mod loader;
pub mod recognizer;
pub mod stub;
pub mod synthesizer;
pub mod translator;

pub use loader::LazyLoader;
pub use recognizer::{RecognitionMeta, RecognitionResult, Recognizer};
pub use stub::{StubRecognizer, StubSynthesizer, StubTranslator};
pub use synthesizer::{SynthesisResult, Synthesizer};
pub use translator::Translator;

use std::sync::Arc;
use std::time::Duration;

/// The three lazily-loaded model capabilities, bundled for `AppContext`.
pub struct ModelGateway {
    pub recognizer: Arc<LazyLoader<Arc<dyn Recognizer>>>,
    pub translator: Arc<LazyLoader<Arc<dyn Translator>>>,
    pub synthesizer: Arc<LazyLoader<Arc<dyn Synthesizer>>>,
}

impl ModelGateway {
    /// Build a gateway backed by the deterministic stub adapters, each
    /// unloaded after `idle_unload` of disuse.
    pub fn stub(idle_unload: Duration) -> Self {
        Self {
            recognizer: Arc::new(LazyLoader::new("recognizer", idle_unload, || async {
                let r = StubRecognizer::new();
                r.initialize().await?;
                Ok(Arc::new(r) as Arc<dyn Recognizer>)
            })),
            translator: Arc::new(LazyLoader::new("translator", idle_unload, || async {
                let t = StubTranslator::new();
                t.initialize().await?;
                Ok(Arc::new(t) as Arc<dyn Translator>)
            })),
            synthesizer: Arc::new(LazyLoader::new("synthesizer", idle_unload, || async {
                let s = StubSynthesizer::new();
                s.initialize().await?;
                Ok(Arc::new(s) as Arc<dyn Synthesizer>)
            })),
        }
    }

    /// Spawn the idle-unload background tasks for all three loaders.
    pub fn spawn_idle_unload_tasks(&self, check_interval: Duration) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            loader::spawn_idle_unload_task(self.recognizer.clone(), check_interval),
            loader::spawn_idle_unload_task(self.translator.clone(), check_interval),
            loader::spawn_idle_unload_task(self.synthesizer.clone(), check_interval),
        ]
    }
}
