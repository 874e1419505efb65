//! The `exam` module.

use crate::browser::Element;
use crate::feature::{Cleanups, Feature, FeatureContext, FeatureError, FeatureModule, ModuleI18n};
use crate::modules::wait_timeout_ms;
use crate::services::Services;
use std::sync::Arc;
use tracing::debug;

/// Module id.
pub const EXAM_MODULE: &str = "exam";

/// Watermark containers used by the exam page.
pub const WATERMARK_SELECTORS: [&str; 2] = ["#symbol-water-mark", "#Symbol(water-mark)"];

/// Builds the module.
pub fn exam_module(services: Arc<Services>) -> Result<FeatureModule, FeatureError> {
    let i18n = ModuleI18n::from_json(include_str!("i18n/exam.json"))?;
    FeatureModule::new(EXAM_MODULE, services)?
        .with_i18n(i18n)
        .with_feature("mark", exam_mark())
}

/// Watermarks whose background was cleared, with the original value.
#[derive(Default)]
pub struct MarkScratch {
    cleared: Vec<(Element, Option<String>)>,
}

fn exam_mark() -> Feature<MarkScratch> {
    Feature::enable("examMark", |ctx: FeatureContext<MarkScratch>| async move {
        let mut cleanups = Cleanups::new();
        for selector in WATERMARK_SELECTORS {
            let ctx = ctx.clone();
            cleanups.push(tokio::spawn(async move {
                let services = ctx.services();
                match services
                    .dom()
                    .wait_for_element(selector, wait_timeout_ms(services))
                    .await
                {
                    Ok(mark) => {
                        let original = mark.remove_style("background");
                        ctx.scratch(|s| s.cleared.push((mark, original)));
                        debug!("Cleared watermark {}", selector);
                    }
                    Err(e) => debug!("No watermark {}: {}", selector, e),
                }
            }));
        }
        Ok(cleanups)
    })
    .with_disable(|ctx: FeatureContext<MarkScratch>| async move {
        let cleared = ctx.scratch(|s| std::mem::take(&mut s.cleared));
        for (mark, original) in cleared {
            if let Some(background) = original {
                mark.set_style("background", background);
            }
        }
        Ok(Cleanups::new())
    })
}
