//! Generation manager — keeps one model resident and queues requests.
//!
//! The KV cache makes a [`VarModel`] single-tenant, so the manager owns the
//! model and a codebook on a dedicated blocking thread and processes
//! [`GenerationParams`] one at a time. On a CUDA OOM a manager started from
//! weight files reloads everything on CPU and retries once.
//!
//! # Example
//!
//! ```no_run
//! use var_rs::config::{CodebookConfig, VarConfig};
//! use var_rs::manager::{GenerationManager, ManagerConfig};
//! use var_rs::model::GenerationParams;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ManagerConfig::new(
//!         VarConfig::for_depth(16),
//!         vec!["var_d16.safetensors".into()],
//!         CodebookConfig::default(),
//!         vec!["vae_ch160v4096z32.safetensors".into()],
//!     );
//!     let manager = GenerationManager::start(config).await.unwrap();
//!     let pyramid = manager.generate(GenerationParams::default()).await.unwrap();
//! }
//! ```

use std::path::PathBuf;

use candle_core::{DType, Device};
use tokio::sync::{mpsc, oneshot};

use crate::codebook::{Codebook, VectorQuantizer};
use crate::config::{CodebookConfig, VarConfig};
use crate::model::{Generation, GenerationParams, VarModel};
use crate::{Error, Result};

/// Configuration for the generation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub model_config: VarConfig,
    pub model_weights: Vec<PathBuf>,
    pub codebook_config: CodebookConfig,
    pub codebook_weights: Vec<PathBuf>,

    /// CUDA device ordinal (0 = first GPU). Ignored when CUDA is unavailable.
    pub cuda_device: usize,

    /// Data type for model weights and activations.
    pub dtype: DType,

    /// Requests that may wait in the queue before `generate` back-pressures.
    pub queue_depth: usize,
}

impl ManagerConfig {
    pub fn new(
        model_config: VarConfig,
        model_weights: Vec<PathBuf>,
        codebook_config: CodebookConfig,
        codebook_weights: Vec<PathBuf>,
    ) -> Self {
        Self {
            model_config,
            model_weights,
            codebook_config,
            codebook_weights,
            cuda_device: 0,
            dtype: DType::F32,
            queue_depth: 64,
        }
    }
}

/// A submitted generation request.
struct PendingRequest {
    params: GenerationParams,
    reply: oneshot::Sender<Result<Generation>>,
}

/// Everything the worker thread owns.
struct Resident {
    model: VarModel,
    codebook: Box<dyn Codebook + Send>,
    /// Present when the model came from files and can be reloaded on CPU.
    reload: Option<ManagerConfig>,
}

/// Handle for submitting generation requests to a running manager.
#[derive(Clone)]
pub struct GenerationManager {
    tx: mpsc::Sender<PendingRequest>,
}

impl GenerationManager {
    /// Load the model and codebook from disk, then start the worker.
    ///
    /// Returns an error if the initial load fails.
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        let queue_depth = config.queue_depth;
        let resident = tokio::task::spawn_blocking(move || -> Result<Resident> {
            let device = preferred_device(config.cuda_device);
            tracing::info!(device = ?device, "loading VAR model and codebook");
            let (model, codebook) = load_resident(&config, &device)?;
            Ok(Resident {
                model,
                codebook: Box::new(codebook),
                reload: Some(config),
            })
        })
        .await
        .map_err(|join_error| Error::Manager(format!("model load task panicked: {join_error}")))?
        .map_err(|e| Error::Manager(format!("model load failed: {e}")))?;

        Ok(Self::spawn(resident, queue_depth))
    }

    /// Start a worker around an already built model and codebook.
    pub fn start_with(model: VarModel, codebook: Box<dyn Codebook + Send>, queue_depth: usize) -> Self {
        Self::spawn(
            Resident {
                model,
                codebook,
                reload: None,
            },
            queue_depth,
        )
    }

    fn spawn(resident: Resident, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<PendingRequest>(queue_depth.max(1));
        tokio::task::spawn_blocking(move || run_manager(resident, rx));
        Self { tx }
    }

    /// Submit a generation request and wait for the result.
    pub async fn generate(&self, params: GenerationParams) -> Result<Generation> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<Generation>>();
        self.tx
            .send(PendingRequest {
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }
}

fn load_resident(config: &ManagerConfig, device: &Device) -> Result<(VarModel, VectorQuantizer)> {
    let model = VarModel::load(
        config.model_config.clone(),
        &config.model_weights,
        device,
        config.dtype,
    )?;
    let codebook = VectorQuantizer::load(
        &config.codebook_config,
        &config.codebook_weights,
        device,
        config.dtype,
    )?;
    Ok((model, codebook))
}

/// The manager loop — runs in a dedicated blocking thread.
///
/// Requests are processed strictly in arrival order.
fn run_manager(mut resident: Resident, mut rx: mpsc::Receiver<PendingRequest>) {
    while let Some(request) = rx.blocking_recv() {
        let result = generate_with_retry(&mut resident, &request.params);
        // Ignore send errors — caller may have gone away.
        let _ = request.reply.send(result);
    }
    tracing::info!("generation manager shut down");
}

/// Generate; on CUDA OOM reload on CPU (when possible) and retry once.
fn generate_with_retry(resident: &mut Resident, params: &GenerationParams) -> Result<Generation> {
    match resident.model.generate(resident.codebook.as_ref(), params) {
        Ok(generation) => Ok(generation),
        Err(ref error) if is_oom_error(error) && resident.reload.is_some() => {
            tracing::warn!(%error, "CUDA OOM — reloading model on CPU and retrying");
            let Some(config) = resident.reload.as_ref() else {
                return Err(Error::Manager("no weights to reload from".into()));
            };
            let (model, codebook) = load_resident(config, &Device::Cpu)
                .map_err(|e| Error::Manager(format!("CPU offload failed: {e}")))?;
            resident.model = model;
            resident.codebook = Box::new(codebook);
            tracing::info!("model offloaded to CPU");
            resident
                .model
                .generate(resident.codebook.as_ref(), params)
                .map_err(|e| Error::Manager(format!("generation failed even on CPU: {e}")))
        }
        Err(error) => Err(error),
    }
}

/// Return the preferred device: CUDA if available, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    Device::cuda_if_available(cuda_ordinal).unwrap_or(Device::Cpu)
}

/// Return true if the error looks like a CUDA out-of-memory condition.
///
/// Candle surfaces CUDA errors as boxed errors whose `Display` contains the
/// driver's error string, so this matches on substrings.
pub fn is_oom_error(error: &crate::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("out of memory")
        || msg.contains("cudaerrormemorya") // cudaErrorMemoryAllocation
        || msg.contains("cuda_error_out_of_memory")
        || msg.contains("cublas_status_alloc_failed")
        || msg.contains("alloc failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConditioningMode;
    use crate::model::LabelSpec;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_manager() -> (VarMap, VarMap, GenerationManager) {
        let cfg = VarConfig {
            num_classes: 4,
            vocab_size: 8,
            codebook_dim: 4,
            patch_nums: vec![1, 2],
            depth: 1,
            embed_dim: 8,
            num_heads: 2,
            conditioning: ConditioningMode::AdaLn,
            ..VarConfig::default()
        };
        let model_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&model_vars, DType::F32, &Device::Cpu);
        let model = VarModel::new(cfg, vb).unwrap();

        let vq_cfg = CodebookConfig {
            vocab_size: 8,
            codebook_dim: 4,
            patch_nums: vec![1, 2],
            ..CodebookConfig::default()
        };
        let vq_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vq_vars, DType::F32, &Device::Cpu);
        let vq = VectorQuantizer::new(&vq_cfg, vb).unwrap();

        let manager = GenerationManager::start_with(model, Box::new(vq), 4);
        (model_vars, vq_vars, manager)
    }

    #[test]
    fn test_is_oom_error_matches_known_patterns() {
        fn make_err(msg: &str) -> crate::Error {
            crate::Error::Manager(msg.to_string())
        }

        assert!(is_oom_error(&make_err("CUDA out of memory")));
        assert!(is_oom_error(&make_err("cudaErrorMemoryAllocation")));
        assert!(is_oom_error(&make_err("CUDA_ERROR_OUT_OF_MEMORY")));
        assert!(is_oom_error(&make_err("alloc failed")));
        assert!(!is_oom_error(&make_err("shape mismatch")));
        assert!(!is_oom_error(&make_err("invalid index")));
    }

    #[test]
    fn test_manager_config_defaults() {
        let config = ManagerConfig::new(
            VarConfig::default(),
            vec![],
            CodebookConfig::default(),
            vec![],
        );
        assert_eq!(config.cuda_device, 0);
        assert_eq!(config.dtype, DType::F32);
        assert_eq!(config.queue_depth, 64);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_are_serialized() {
        let (_mv, _qv, manager) = tiny_manager();
        let params = GenerationParams {
            batch: 2,
            label: LabelSpec::Class(1),
            seed: Some(5),
            ..GenerationParams::default()
        };

        let a = manager.clone();
        let b = manager.clone();
        let (pa, pb) = (params.clone(), params);
        let (ra, rb) = tokio::join!(a.generate(pa), b.generate(pb));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.labels, vec![1, 1]);
        assert_eq!(ra.indices().unwrap(), rb.indices().unwrap());
    }

    #[tokio::test]
    async fn errors_reach_the_caller() {
        let (_mv, _qv, manager) = tiny_manager();
        let params = GenerationParams {
            label: LabelSpec::Class(40),
            ..GenerationParams::default()
        };
        assert!(matches!(manager.generate(params).await, Err(Error::Shape(_))));
        // The worker survives a failed request.
        assert!(manager.generate(GenerationParams::default()).await.is_ok());
    }

    #[tokio::test]
    async fn closed_worker_is_reported() {
        let (tx, rx) = mpsc::channel::<PendingRequest>(1);
        drop(rx);
        let manager = GenerationManager { tx };
        assert!(matches!(
            manager.generate(GenerationParams::default()).await,
            Err(Error::Manager(_))
        ));
    }
}
