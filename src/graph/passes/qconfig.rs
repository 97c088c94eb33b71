use crate::error::Result;
use crate::graph::context::GraphModContext;

use super::{layer_nodes, Pass};

/// Annotate quantizable layers with the context's observer types
///
/// Filtered-out layers lose any qconfig they carried. An existing qconfig is
/// kept when `override_qconfig` is off.
pub struct SetQConfig;

impl Pass for SetQConfig {
    fn name(&self) -> &'static str {
        "set_qconfig"
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        let decisions: Vec<(String, bool)> = layer_nodes(ctx.gm())
            .into_iter()
            .map(|(_, target)| {
                let included = ctx.is_included(&target);
                (target, included)
            })
            .collect();
        let observers = ctx.observers().clone();
        let override_qconfig = ctx.override_qconfig();

        for (target, included) in decisions {
            let Some(module) = ctx.gm_mut().submodule_mut(&target) else {
                continue;
            };
            if !included {
                module.qconfig = None;
            } else if module.qconfig.is_none() || override_qconfig {
                module.qconfig = Some(observers.clone());
            }
        }
        Ok(())
    }
}
