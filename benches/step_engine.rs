//! Step Engine Benchmarks
//!
//! Step runners execute inside the renderer's audio callback, so one block of
//! work must finish well inside the block's time budget:
//!
//! ```text
//! time_budget = buffer_size / sample_rate
//! ```
//!
//! | Sample Rate | Buffer 64 | Buffer 128 | Buffer 256 | Buffer 512 |
//! |-------------|-----------|------------|------------|------------|
//! | 44.1 kHz    | 1.45 ms   | 2.90 ms    | 5.80 ms    | 11.61 ms   |
//! | 48 kHz      | 1.33 ms   | 2.67 ms    | 5.33 ms    | 10.67 ms   |
//! | 96 kHz      | 0.67 ms   | 1.33 ms    | 2.67 ms    | 5.33 ms    |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use patchbay::prelude::*;

const SAMPLE_RATES: [f64; 3] = [44100.0, 48000.0, 96000.0];
const BUFFER_SIZES: [usize; 4] = [64, 128, 256, 512];

fn running_pair(pattern: Pattern, subdivision: f64) -> (StepController, StepRunner) {
    let (mut controller, runner) =
        step_channel(pattern, StepEngine::new(300.0, subdivision), 64, 1024);
    controller.send(ControlMessage::Start);
    (controller, runner)
}

fn bench_internal_clock(c: &mut Criterion) {
    let mut group = c.benchmark_group("internal_clock");

    for sample_rate in SAMPLE_RATES {
        for buffer_size in BUFFER_SIZES {
            let name = format!("{}kHz/{}samples", sample_rate as u32 / 1000, buffer_size);
            group.throughput(Throughput::Elements(buffer_size as u64));
            group.bench_with_input(
                BenchmarkId::new("sequencer", &name),
                &(sample_rate, buffer_size),
                |b, &(sr, frames)| {
                    let (mut controller, mut runner) =
                        running_pair(Pattern::Sequencer(SequencerPattern::new(1)), 4.0);
                    let mut gate = vec![0.0f32; frames];
                    let mut pitch = vec![0.0f32; frames];
                    let mut events = Vec::with_capacity(1024);
                    let mut now = 0.0;
                    b.iter(|| {
                        runner.process(
                            now,
                            sr,
                            frames,
                            BlockInputs::default(),
                            Some(BlockOutputs {
                                gate: &mut gate,
                                pitch: &mut pitch,
                            }),
                        );
                        now += frames as f64 / sr;
                        events.clear();
                        black_box(controller.drain_events(&mut events));
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_external_clock(c: &mut Criterion) {
    let mut group = c.benchmark_group("external_clock");

    for buffer_size in BUFFER_SIZES {
        group.throughput(Throughput::Elements(buffer_size as u64));
        group.bench_with_input(
            BenchmarkId::new("arpeggiator", buffer_size),
            &buffer_size,
            |b, &frames| {
                let mut arp = ArpPattern::new(1);
                for note in [60, 64, 67, 71] {
                    arp.notes.press(note);
                }
                arp.set_octaves(3);
                let (mut controller, mut runner) = running_pair(Pattern::Arp(arp), 4.0);
                controller.send(ControlMessage::SetExternalClock(true));

                // A pulse every 32 samples
                let clock: Vec<f32> = (0..frames)
                    .map(|i| if i % 32 < 16 { 1.0 } else { 0.0 })
                    .collect();
                let mut events = Vec::with_capacity(1024);
                let mut now = 0.0;
                b.iter(|| {
                    runner.process(
                        now,
                        48000.0,
                        frames,
                        BlockInputs {
                            clock: Some(&clock),
                            ..Default::default()
                        },
                        None,
                    );
                    now += frames as f64 / 48000.0;
                    events.clear();
                    black_box(controller.drain_events(&mut events));
                });
            },
        );
    }

    group.finish();
}

fn bench_patch_edits(c: &mut Criterion) {
    c.bench_function("patch/connect_disconnect", |b| {
        let mut patch = Patch::new(MemoryRenderer::new(48000.0), EngineConfig::default()).unwrap();
        let osc = patch.create(ModuleKind::Oscillator, (0.0, 0.0)).unwrap();
        patch.settle(1);
        let output = patch.output();
        b.iter(|| {
            let id = patch
                .connect(PortRef::new(osc, "out"), PortRef::new(output, "in"))
                .unwrap();
            black_box(patch.disconnect(id).unwrap());
        });
    });
}

criterion_group!(step_benches, bench_internal_clock, bench_external_clock);
criterion_group!(patch_benches, bench_patch_edits);
criterion_main!(step_benches, patch_benches);
