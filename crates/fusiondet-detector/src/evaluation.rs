//! Single-pass evaluation loop.
//!
//! Runs [`SparseFusionDetector::forward_test`] over every batch in inference
//! mode, with rescaling enabled, and collects one [`SampleResult`] per
//! sample in loader order. Progress is reported through `tracing` after each
//! batch. Rendering results is left to consumers of the returned list.

use fusiondet_types::{FusionError, SampleResult};
use tracing::info;

use crate::detector::{SparseFusionDetector, TestBatch};
use crate::trainability::Mode;

/// Evaluate `detector` on `batches`.
///
/// The detector is switched to [`Mode::Eval`] for the duration of the loop
/// and restored to its previous mode afterwards, also on error.
pub fn run_single_pass_test<I>(
    detector: &mut SparseFusionDetector,
    batches: I,
) -> Result<Vec<SampleResult>, FusionError>
where
    I: IntoIterator<Item = TestBatch>,
{
    let previous = detector.mode();
    detector.set_mode(Mode::Eval);
    let outcome = evaluate(detector, batches.into_iter());
    detector.set_mode(previous);
    outcome
}

fn evaluate<I>(detector: &SparseFusionDetector, batches: I) -> Result<Vec<SampleResult>, FusionError>
where
    I: Iterator<Item = TestBatch>,
{
    let (expected, _) = batches.size_hint();
    let mut results = Vec::new();

    for (index, batch) in batches.enumerate() {
        let batch_results = detector.forward_test(batch, true)?;
        let batch_size = batch_results.len();
        results.extend(batch_results);
        info!(
            batch = index + 1,
            expected_batches = expected,
            batch_size,
            completed_samples = results.len(),
            "evaluation progress"
        );
    }

    Ok(results)
}
