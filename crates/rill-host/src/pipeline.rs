//! The feature pipeline driver.
//!
//! Stages run sequentially, each receiving the message the previous stage
//! produced. A failing prologue short-circuits the main stage but later
//! prologues still run (they may normalize errors), and epilogues always run.
//! Epilogue failures are logged and swallowed so they can never overwrite an
//! already-formed response.

use rill_core::Message;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::HostError;
use crate::feature::Feature;

/// Drive `request` through the feature's stages and produce the reply.
pub async fn run(feature: &Feature, ctx: &Context, request: Message) -> Message {
    feature.record_hit();

    let mut current = request;
    let mut skip_main = false;
    // Set once a sentinel fixed the response; epilogues then only observe.
    let mut pinned = false;

    for (index, stage) in feature.stages.iter().enumerate() {
        let is_main = index == feature.main_stage;
        let is_epilogue = index > feature.main_stage;

        if stage.access > ctx.access {
            debug!(
                stage = %stage.name,
                required = stage.access.as_str(),
                caller = ctx.access.as_str(),
                "insufficient access, skipping stage"
            );
            if !is_epilogue && !pinned {
                current = Message::forbidden("insufficient access");
                skip_main = true;
            }
            continue;
        }

        if is_main && skip_main {
            continue;
        }
        // A pinned response passes the remaining prologues untouched.
        if pinned && !is_epilogue {
            continue;
        }

        let outcome = (stage.handler)(ctx.clone(), current.clone()).await;
        match outcome {
            Ok(message) => {
                if is_epilogue {
                    if !pinned {
                        current = message;
                    }
                } else {
                    // A non-success status from a prologue (or the main
                    // stage itself) short-circuits the main stage.
                    if message.status >= 300 {
                        skip_main = true;
                    }
                    current = message;
                }
            }
            Err(HostError::CachedResponse(message)) => {
                // Bypasses every remaining stage.
                debug!(stage = %stage.name, "cached response short-circuit");
                return message;
            }
            Err(HostError::AbortedWithResponse(message)) => {
                if is_epilogue {
                    warn!(stage = %stage.name, "epilogue abort ignored");
                    continue;
                }
                current = message;
                skip_main = true;
                pinned = true;
            }
            Err(HostError::Core(err)) => {
                if is_epilogue {
                    warn!(stage = %stage.name, error = %err, "epilogue failed, response preserved");
                    continue;
                }
                warn!(
                    stage = %stage.name,
                    verb = %ctx.verb,
                    uri = %ctx.uri,
                    error = %err,
                    "stage failed"
                );
                current = translate(feature, ctx, &err);
                skip_main = true;
            }
        }
    }

    current
}

/// Run the feature's exception translators in order; the first one returning
/// a message wins, otherwise the error maps through the core taxonomy (an
/// unclassified error surfaces as 500).
fn translate(feature: &Feature, ctx: &Context, err: &rill_core::CoreError) -> Message {
    for translator in &feature.translators {
        if let Some(message) = translator(ctx, err) {
            return message;
        }
    }
    err.response()
}
