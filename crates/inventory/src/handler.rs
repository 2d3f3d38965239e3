//! The device handler chain: plugin points invoked in order on every
//! device reconcile.

use async_trait::async_trait;
use gpu_api::device::GPUDevice;

use crate::error::Error;
use crate::metrics;
use crate::result::ReconcileResult;

/// One plugin. Handlers may mutate the in-memory device (typically its
/// state) and ask for a follow-up reconcile.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, device: &mut GPUDevice) -> anyhow::Result<ReconcileResult>;
}

/// Ordered chain of handlers. A failing handler aborts the chain and the
/// device's reconcile; its error counter is incremented.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn DeviceHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Box<dyn DeviceHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn run(&self, device: &mut GPUDevice) -> Result<ReconcileResult, Error> {
        let mut merged = ReconcileResult::default();
        for handler in &self.handlers {
            match handler.handle(device).await {
                Ok(result) => merged = merged.merge(result),
                Err(source) => {
                    metrics::handler_error(handler.name());
                    return Err(Error::Handler {
                        handler: handler.name(),
                        source,
                    });
                }
            }
        }
        Ok(merged)
    }
}
