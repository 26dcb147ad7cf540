//! Device Selection & Losses
//!
//! Device helpers and the loss functions the training loop offers.
//!
//! ## Thread Safety
//!
//! The engine evaluates one sample fully synchronously; the parallelism
//! this crate supports is coarser — independent samples of a batch across
//! worker threads, each with its own decoded sample. Metal GPU command
//! buffers are **not thread-safe** for concurrent encoding, so for such
//! workloads you have several options:
//!
//! ### Option 1: Force CPU mode (recommended for parallel evaluation)
//! ```bash
//! export GROUNDNET_NO_GPU=1
//! ```
//!
//! ### Option 2: Use thread-local devices
//! ```rust,ignore
//! use groundnet::primitives::thread_local_device;
//!
//! rayon::scope(|s| {
//!     for sample in &samples {
//!         s.spawn(move |_| {
//!             let device = thread_local_device(); // Each thread gets its own device
//!             // ... evaluate the sample ...
//!         });
//!     }
//! });
//! ```
//!
//! ### Option 3: Synchronize GPU access
//! ```rust,ignore
//! use groundnet::primitives::with_gpu_sync;
//!
//! with_gpu_sync(|| {
//!     // GPU operations are serialized here
//! });
//! ```

use crate::{GroundNetError, Result};
use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::OnceLock;
use tracing::info;

// ============================================================================
// GPU Synchronization
// ============================================================================

/// Global mutex for serializing GPU command buffer access when needed.
///
/// Use `with_gpu_sync()` to safely execute GPU operations from multiple threads.
static GPU_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();

fn gpu_mutex() -> &'static Mutex<()> {
    GPU_MUTEX.get_or_init(|| Mutex::new(()))
}

/// Execute a closure with synchronized GPU access.
///
/// This serializes GPU command buffer encoding to avoid Metal thread safety
/// issues. Use this when you want GPU acceleration while evaluating samples
/// from multiple threads and can tolerate serialized execution.
pub fn with_gpu_sync<T, F: FnOnce() -> T>(f: F) -> T {
    let _guard = gpu_mutex().lock();
    f()
}

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via environment variable.
///
/// Set `GROUNDNET_NO_GPU=1` to force CPU-only mode. This is recommended for
/// parallel workloads where worker threads evaluate independent samples.
pub fn gpu_disabled() -> bool {
    std::env::var("GROUNDNET_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `GROUNDNET_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
///
/// # Thread Safety Warning
///
/// Metal devices are **not thread-safe** for concurrent command buffer
/// encoding. If you evaluate samples from several threads, either:
/// - Set `GROUNDNET_NO_GPU=1` to force CPU mode
/// - Use `thread_local_device()` for per-thread devices
/// - Use `with_gpu_sync()` to serialize GPU access
pub fn best_device() -> Device {
    // Check for forced CPU mode
    if gpu_disabled() {
        info!("using CPU device (GROUNDNET_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("using Metal device (Apple Silicon)");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("using CUDA device (NVIDIA GPU)");
            return device;
        }
    }

    info!("using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
///
/// Use this when you need guaranteed thread-safe tensor operations, such as
/// evaluating a dataset's samples in parallel against shared weights.
pub fn cpu_device() -> Device {
    Device::Cpu
}

// ============================================================================
// Thread-Local Device for Parallel Workloads
// ============================================================================

thread_local! {
    /// Thread-local device instance.
    ///
    /// Each thread gets its own device to avoid Metal command buffer
    /// conflicts when samples are evaluated in parallel.
    static THREAD_LOCAL_DEVICE: RefCell<Option<Device>> = const { RefCell::new(None) };
}

/// Get a thread-local device for the current thread.
///
/// This is the recommended approach for parallel workloads where each
/// worker thread evaluates its own samples. Each thread gets its own device
/// instance, avoiding Metal command buffer conflicts.
///
/// **Note**: When `GROUNDNET_NO_GPU=1` is set, all threads use CPU.
pub fn thread_local_device() -> Device {
    THREAD_LOCAL_DEVICE.with(|cell| {
        let mut opt = cell.borrow_mut();
        if opt.is_none() {
            // Initialize device for this thread
            let device = if gpu_disabled() {
                Device::Cpu
            } else {
                #[cfg(feature = "metal")]
                {
                    // Metal devices on the same GPU share command queue
                    // state; CPU is safer for truly parallel workloads, but
                    // we try Metal in case the user wants it.
                    if let Ok(device) = Device::new_metal(0) {
                        static LOGGED: std::sync::atomic::AtomicBool =
                            std::sync::atomic::AtomicBool::new(false);
                        if !LOGGED.swap(true, std::sync::atomic::Ordering::Relaxed) {
                            info!("thread-local Metal device (Apple Silicon)");
                        }
                        device
                    } else {
                        Device::Cpu
                    }
                }
                #[cfg(all(feature = "cuda", not(feature = "metal")))]
                {
                    if let Ok(device) = Device::new_cuda(0) {
                        device
                    } else {
                        Device::Cpu
                    }
                }
                #[cfg(not(any(feature = "metal", feature = "cuda")))]
                {
                    Device::Cpu
                }
            };
            *opt = Some(device);
        }
        opt.as_ref().unwrap().clone()
    })
}

// ============================================================================
// Device Availability Checks
// ============================================================================

/// Check if Metal is available (respects GROUNDNET_NO_GPU)
#[cfg(feature = "metal")]
pub fn metal_available() -> bool {
    !gpu_disabled() && Device::new_metal(0).is_ok()
}

/// Check if Metal is available (always false when `metal` feature is not enabled)
#[cfg(not(feature = "metal"))]
pub fn metal_available() -> bool {
    false
}

/// Check if CUDA is available (respects GROUNDNET_NO_GPU)
#[cfg(feature = "cuda")]
pub fn cuda_available() -> bool {
    !gpu_disabled() && Device::new_cuda(0).is_ok()
}

/// Check if CUDA is available (always false when `cuda` feature is not enabled)
#[cfg(not(feature = "cuda"))]
pub fn cuda_available() -> bool {
    false
}

/// Check if any GPU is available and enabled
pub fn gpu_available() -> bool {
    !gpu_disabled() && (metal_available() || cuda_available())
}

// ============================================================================
// Losses
// ============================================================================

/// Binary cross-entropy loss
///
/// BCE = -[y * log(p) + (1-y) * log(1-p)]
pub fn binary_cross_entropy(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let eps = 1e-7f32;
    let pred_clamped = pred
        .clamp(eps, 1.0 - eps)
        .map_err(|e| GroundNetError::Tensor(format!("Clamp failed: {}", e)))?;
    let log_p = pred_clamped
        .log()
        .map_err(|e| GroundNetError::Tensor(format!("Log failed: {}", e)))?;

    // Use ones_like to preserve dtype (avoid F64 promotion from 1.0 literal)
    let ones = Tensor::ones_like(&pred_clamped)
        .map_err(|e| GroundNetError::Tensor(format!("ones_like failed: {}", e)))?;
    let one_minus_pred = (&ones - &pred_clamped)
        .map_err(|e| GroundNetError::Tensor(format!("1-pred failed: {}", e)))?;
    let log_1_p = one_minus_pred
        .log()
        .map_err(|e| GroundNetError::Tensor(format!("Log 1-p failed: {}", e)))?;

    let term1 = target
        .mul(&log_p)
        .map_err(|e| GroundNetError::Tensor(format!("BCE term1 failed: {}", e)))?;

    let ones_target = Tensor::ones_like(target)
        .map_err(|e| GroundNetError::Tensor(format!("ones_like target failed: {}", e)))?;
    let one_minus_target = (&ones_target - target)
        .map_err(|e| GroundNetError::Tensor(format!("1-target failed: {}", e)))?;
    let term2 = one_minus_target
        .mul(&log_1_p)
        .map_err(|e| GroundNetError::Tensor(format!("BCE term2 failed: {}", e)))?;

    let loss = (term1 + term2)?;
    let neg_loss = loss
        .neg()
        .map_err(|e| GroundNetError::Tensor(format!("Neg failed: {}", e)))?;
    neg_loss
        .mean_all()
        .map_err(|e| GroundNetError::Tensor(format!("BCE mean failed: {}", e)))
}

/// Mean squared error loss
pub fn mse_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = (pred - target)
        .map_err(|e| GroundNetError::Tensor(format!("MSE diff failed: {}", e)))?;
    diff.sqr()?
        .mean_all()
        .map_err(|e| GroundNetError::Tensor(format!("MSE failed: {}", e)))
}
