//! §4.8 benchmark harness: measures guest call overhead without leaving any
//! observable state behind, since `preempt` already saves and restores the
//! full register set around each sample.

use std::time::Instant;

use crate::error::ScriptResult;
use crate::machine::GuestAddr;
use crate::script_instance::{CallTarget, ScriptInstance};

const ITERATIONS_PER_SAMPLE: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkReport {
    pub lowest_ns: u64,
    pub median_ns: u64,
    pub highest_ns: u64,
}

fn median_ns(mut samples: Vec<u64>) -> u64 {
    samples.sort_unstable();
    samples[samples.len() / 2]
}

/// Runs `address` in a tight loop of 2000 iterations per sample, for
/// `rounds` samples, timing each iteration individually and reducing each
/// sample to its median. The final report is the median of those
/// per-sample medians, bracketed by the lowest and highest sample median
/// observed.
pub fn vmbench(instance: &mut ScriptInstance, address: GuestAddr, rounds: u32) -> ScriptResult<BenchmarkReport> {
    let mut sample_medians = Vec::with_capacity(rounds.max(1) as usize);

    for _ in 0..rounds.max(1) {
        let mut iteration_ns = Vec::with_capacity(ITERATIONS_PER_SAMPLE as usize);
        for _ in 0..ITERATIONS_PER_SAMPLE {
            let start = Instant::now();
            instance.preempt(CallTarget::Address(address), &[])?;
            iteration_ns.push(start.elapsed().as_nanos() as u64);
        }
        sample_medians.push(median_ns(iteration_ns));
    }

    let lowest = sample_medians.iter().copied().min().unwrap_or(0);
    let highest = sample_medians.iter().copied().max().unwrap_or(0);
    let median = median_ns(sample_medians);

    Ok(BenchmarkReport { lowest_ns: lowest, median_ns: median, highest_ns: highest })
}
