use async_trait::async_trait;
use std::sync::Arc;

use aicentral_endpoint::{CallDetails, GatewayResponse, RequestContext};

use crate::pipeline::SelectorAdapter;

/// One link in the pipeline chain.
///
/// A step either short-circuits by returning its own response without calling
/// `next` (auth rejections, rate limits), or runs `next` and post-processes
/// the result on the way back out. Steps must not assume they are the only
/// instance of their type in the chain.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    async fn handle(
        &self,
        ctx: &RequestContext,
        call: CallDetails,
        next: Next<'_>,
    ) -> GatewayResponse;
}

/// The rest of the chain after the current step, ending in the endpoint
/// selector.
pub struct Next<'a> {
    pub(crate) steps: &'a [Arc<dyn PipelineStep>],
    pub(crate) terminal: &'a SelectorAdapter,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &RequestContext, call: CallDetails) -> GatewayResponse {
        match self.steps.split_first() {
            Some((step, rest)) => {
                step.handle(
                    ctx,
                    call,
                    Next {
                        steps: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.execute(ctx, call).await,
        }
    }
}
