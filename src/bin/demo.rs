//! Scheduling demo: runs the engine against the offline backend and logs
//! what would be scheduled, without needing an audio device.

use clap::Parser;
use tracing::info;

use ostinato::backend::Waveform;
use ostinato::clock::LOOKAHEAD_MS;
use ostinato::engine::Engine;
use ostinato::instrument::AutomationSource;
use ostinato::lfo::Lfo;
use ostinato::offline::OfflineBackend;
use ostinato::pattern::{Chord, Cycle, Pattern};
use ostinato::synth::Synth;

#[derive(Parser)]
#[command(name = "ostinato-demo", about = "Run the pattern scheduler offline")]
struct Args {
    /// Tempo in beats per minute
    #[arg(long, default_value_t = 120.0)]
    bpm: f64,

    /// How many bars to schedule
    #[arg(long, default_value_t = 8)]
    bars: u32,

    /// Euclidean onsets per 8 steps
    #[arg(long, default_value_t = 3)]
    pulses: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let args = Args::parse();
    let mut engine = Engine::new(OfflineBackend::new(), args.bpm);

    let mut synth = Synth::new();
    synth.set_pattern(vec![Cycle::from_steps(vec![Chord::single(48.0); 8])]);
    synth.pattern_mut().euclid(args.pulses, 8, 0);
    synth.set_waveforms(vec![Waveform::Saw]);
    synth
        .core_mut()
        .set_pan(AutomationSource::Lfo(Lfo::from_range(
            -0.8, 0.8, 1.0, args.bpm,
        )));
    synth
        .core_mut()
        .set_postgain(AutomationSource::Steps(Pattern::from_steps(vec![
            Some(1.0),
            Some(0.6),
        ])));
    engine.add_instrument(Box::new(synth), 0);

    engine.start();

    let bar_duration = engine.clock().bar_duration();
    let total = bar_duration * args.bars as f64;
    let tick = LOOKAHEAD_MS / 1000.0;
    let mut now = 0.0;
    while now < total {
        now += tick;
        engine.backend_mut().set_now(now);
        engine.tick();
    }
    engine.stop();

    info!(
        bars = args.bars,
        nodes = engine.backend().node_count(),
        "done scheduling"
    );
}
