//! Capture/replay units for kernel launches.
//!
//! A [`CapturedLaunch`] records `calls` consecutive launches once and re-runs
//! them as a unit. On CUDA devices (with the `cuda-kernels` feature) this is a
//! CUDA graph: the launches are stream-captured, instantiated and replayed with
//! a single `cuGraphLaunch`. Elsewhere the unit keeps the launch closure and
//! re-issues it `calls` times per replay.
//!
//! A captured unit is single-use. It is released exactly once, either through
//! [`CapturedLaunch::reset`] or on drop, whichever happens first.

use candle_core::Device;

#[cfg(feature = "cuda-kernels")]
use candle_core::cuda::cudarc::driver::sys::{CUgraph, CUgraphExec, CUstream};

/// Boxed launch closure as seen by a captured unit.
pub type LaunchFn<'a> = dyn FnMut() -> candle_core::Result<()> + 'a;

/// Errors from capture, replay and release.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture size must be >= 1")]
    EmptyCapture,
    #[error("captured unit was already released")]
    Released,
    #[error("launch failed during capture: {0}")]
    LaunchFailed(#[source] candle_core::Error),
    #[error("capture begin failed with CUDA error {0}")]
    CaptureBeginFailed(i32),
    #[error("capture end failed with CUDA error {0}")]
    CaptureEndFailed(i32),
    #[error("graph instantiation failed with CUDA error {0}")]
    InstantiateFailed(i32),
    #[error("captured graph is empty")]
    EmptyGraph,
    #[error("graph replay failed with CUDA error {0}")]
    ReplayFailed(i32),
    #[error("graph release failed with CUDA error {0}")]
    ReleaseFailed(i32),
    #[error("device error: {0}")]
    Device(String),
}

/// How launches are captured on a given device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBackend {
    /// Re-issue the launch closure from the host on every replay.
    Host,
    /// CUDA stream capture into an executable graph.
    CudaGraph,
}

impl CaptureBackend {
    pub fn for_device(device: &Device) -> Self {
        if cfg!(feature = "cuda-kernels") && device.is_cuda() {
            CaptureBackend::CudaGraph
        } else {
            CaptureBackend::Host
        }
    }
}

#[cfg(feature = "cuda-kernels")]
struct GraphHandles {
    graph: CUgraph,
    graph_exec: CUgraphExec,
    stream: CUstream,
}

#[cfg(feature = "cuda-kernels")]
impl GraphHandles {
    fn destroy(&mut self) -> Result<(), CaptureError> {
        use candle_core::cuda::cudarc::driver::sys::{cuGraphDestroy, cuGraphExecDestroy, CUresult};

        let mut first_error = None;
        unsafe {
            if !self.graph_exec.is_null() {
                let result = cuGraphExecDestroy(self.graph_exec);
                if result != CUresult::CUDA_SUCCESS {
                    first_error.get_or_insert(CaptureError::ReleaseFailed(result as i32));
                }
                self.graph_exec = std::ptr::null_mut();
            }
            if !self.graph.is_null() {
                let result = cuGraphDestroy(self.graph);
                if result != CUresult::CUDA_SUCCESS {
                    first_error.get_or_insert(CaptureError::ReleaseFailed(result as i32));
                }
                self.graph = std::ptr::null_mut();
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

enum Captured<'a> {
    Host { launch: &'a mut LaunchFn<'a> },
    #[cfg(feature = "cuda-kernels")]
    Graph(GraphHandles),
    Released,
}

/// A replayable unit of `calls_per_replay` kernel launches.
pub struct CapturedLaunch<'a> {
    captured: Captured<'a>,
    calls_per_replay: usize,
    backend: CaptureBackend,
}

impl<'a> CapturedLaunch<'a> {
    /// Capture `calls` consecutive invocations of `launch` on `device`.
    ///
    /// The device must be idle (synchronized) before capture begins.
    pub fn capture(
        device: &Device,
        calls: usize,
        launch: &'a mut LaunchFn<'a>,
    ) -> Result<Self, CaptureError> {
        if calls == 0 {
            return Err(CaptureError::EmptyCapture);
        }
        let backend = CaptureBackend::for_device(device);
        let captured = match backend {
            CaptureBackend::Host => Captured::Host { launch },
            CaptureBackend::CudaGraph => Self::capture_graph(device, calls, launch)?,
        };
        tracing::trace!(?backend, calls, "captured launch unit");
        Ok(Self {
            captured,
            calls_per_replay: calls,
            backend,
        })
    }

    #[cfg(feature = "cuda-kernels")]
    fn capture_graph(
        device: &Device,
        calls: usize,
        launch: &mut LaunchFn<'_>,
    ) -> Result<Captured<'a>, CaptureError> {
        use candle_core::cuda::cudarc::driver::sys::{
            cuGraphDestroy, cuGraphInstantiateWithFlags, cuStreamBeginCapture_v2,
            cuStreamEndCapture, CUresult, CUstreamCaptureMode,
        };

        let stream = match device {
            Device::Cuda(cuda_device) => cuda_device.cuda_stream().cu_stream(),
            _ => return Err(CaptureError::Device("device is not CUDA".to_string())),
        };

        let result = unsafe {
            cuStreamBeginCapture_v2(stream, CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_GLOBAL)
        };
        if result != CUresult::CUDA_SUCCESS {
            return Err(CaptureError::CaptureBeginFailed(result as i32));
        }

        for _ in 0..calls {
            if let Err(e) = launch() {
                // Abort the capture; the partial graph is discarded.
                let mut graph: CUgraph = std::ptr::null_mut();
                unsafe {
                    cuStreamEndCapture(stream, &mut graph);
                    if !graph.is_null() {
                        cuGraphDestroy(graph);
                    }
                }
                return Err(CaptureError::LaunchFailed(e));
            }
        }

        let mut graph: CUgraph = std::ptr::null_mut();
        let result = unsafe { cuStreamEndCapture(stream, &mut graph) };
        if result != CUresult::CUDA_SUCCESS {
            return Err(CaptureError::CaptureEndFailed(result as i32));
        }
        if graph.is_null() {
            return Err(CaptureError::EmptyGraph);
        }

        let mut graph_exec: CUgraphExec = std::ptr::null_mut();
        let result = unsafe { cuGraphInstantiateWithFlags(&mut graph_exec, graph, 0) };
        if result != CUresult::CUDA_SUCCESS {
            unsafe {
                cuGraphDestroy(graph);
            }
            return Err(CaptureError::InstantiateFailed(result as i32));
        }

        Ok(Captured::Graph(GraphHandles {
            graph,
            graph_exec,
            stream,
        }))
    }

    #[cfg(not(feature = "cuda-kernels"))]
    fn capture_graph(
        _device: &Device,
        _calls: usize,
        _launch: &mut LaunchFn<'_>,
    ) -> Result<Captured<'a>, CaptureError> {
        Err(CaptureError::Device(
            "CUDA graph capture requires the cuda-kernels feature".to_string(),
        ))
    }

    /// Run the captured launches once.
    pub fn replay(&mut self) -> Result<(), CaptureError> {
        match &mut self.captured {
            Captured::Host { launch } => {
                for _ in 0..self.calls_per_replay {
                    launch().map_err(CaptureError::LaunchFailed)?;
                }
                Ok(())
            }
            #[cfg(feature = "cuda-kernels")]
            Captured::Graph(handles) => {
                use candle_core::cuda::cudarc::driver::sys::{cuGraphLaunch, CUresult};
                let result = unsafe { cuGraphLaunch(handles.graph_exec, handles.stream) };
                if result != CUresult::CUDA_SUCCESS {
                    return Err(CaptureError::ReplayFailed(result as i32));
                }
                Ok(())
            }
            Captured::Released => Err(CaptureError::Released),
        }
    }

    /// Release the captured unit, reporting release failures.
    pub fn reset(mut self) -> Result<(), CaptureError> {
        self.release()
    }

    pub fn calls_per_replay(&self) -> usize {
        self.calls_per_replay
    }

    pub fn backend(&self) -> CaptureBackend {
        self.backend
    }

    pub fn is_released(&self) -> bool {
        matches!(self.captured, Captured::Released)
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        match std::mem::replace(&mut self.captured, Captured::Released) {
            Captured::Host { .. } | Captured::Released => Ok(()),
            #[cfg(feature = "cuda-kernels")]
            Captured::Graph(mut handles) => handles.destroy(),
        }
    }
}

impl Drop for CapturedLaunch<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "failed to release captured launch unit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_host_backend_on_cpu() {
        assert_eq!(CaptureBackend::for_device(&Device::Cpu), CaptureBackend::Host);
    }

    #[test]
    fn test_host_capture_does_not_launch() {
        let count = Cell::new(0usize);
        let mut launch = || {
            count.set(count.get() + 1);
            Ok(())
        };
        let unit = CapturedLaunch::capture(&Device::Cpu, 5, &mut launch).unwrap();
        assert_eq!(count.get(), 0);
        assert_eq!(unit.calls_per_replay(), 5);
        unit.reset().unwrap();
    }

    #[test]
    fn test_replay_runs_all_captured_calls() {
        let count = Cell::new(0usize);
        let mut launch = || {
            count.set(count.get() + 1);
            Ok(())
        };
        let mut unit = CapturedLaunch::capture(&Device::Cpu, 4, &mut launch).unwrap();
        unit.replay().unwrap();
        unit.replay().unwrap();
        unit.reset().unwrap();
        assert_eq!(count.get(), 8);
    }

    #[test]
    fn test_zero_calls_rejected() {
        let mut launch = || Ok(());
        let err = CapturedLaunch::capture(&Device::Cpu, 0, &mut launch).err();
        assert!(matches!(err, Some(CaptureError::EmptyCapture)));
    }

    #[test]
    fn test_replay_propagates_launch_error() {
        let mut launch = || Err(candle_core::Error::Msg("boom".to_string()));
        let mut unit = CapturedLaunch::capture(&Device::Cpu, 2, &mut launch).unwrap();
        let err = unit.replay().unwrap_err();
        assert!(matches!(err, CaptureError::LaunchFailed(_)));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut launch = || Ok(());
        let mut unit = CapturedLaunch::capture(&Device::Cpu, 1, &mut launch).unwrap();
        unit.release().unwrap();
        assert!(unit.is_released());
        assert!(matches!(unit.replay(), Err(CaptureError::Released)));
        // Drop after an explicit release is a no-op.
        drop(unit);
    }
}
