//! Desktop simulator for the anemo-rs ranging pipeline.
//!
//! Runs the core runtime against the mock board: two modelled transducer
//! chips 60 mm apart in still air or a steady wind. The firmware upload,
//! readiness check, gang calibration and pitch/catch cycles all go through
//! the same code as on hardware, on virtual time.
//!
//! # Usage
//!
//! ```text
//! anemo-simulator [cycles] [wind_mps]
//! ```
//!
//! `cycles` defaults to 5 and `wind_mps` (along A to B) to 2.5. Set
//! `RUST_LOG=debug` for driver and bus diagnostics.

use std::cell::Cell;
use std::process::ExitCode;

use log::{error, info};

use anemo_core::asic::FirmwareImage;
use anemo_core::config::AnemometerConfig;
use anemo_core::platform::Platform;
use anemo_core::platform::mock::{AcousticPath, MockPlatform, test_firmware};
use anemo_core::ranging::{Anemometer, RangingReport};
use anemo_core::runtime::{Runtime, TaskQueue};
use anemo_core::supervisor::kick_watchdog;

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

const DEFAULT_CYCLES: u32 = 5;
const DEFAULT_WIND_MPS: f64 = 2.5;
const PATH_LENGTH_MM: u32 = 60;

/// Scheduler passes allowed per requested cycle before giving up.
const PASSES_PER_CYCLE: usize = 2_000;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

struct Args {
    cycles: u32,
    wind_mps: f64,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let cycles = match args.next() {
        Some(raw) => raw.parse().map_err(|_| format!("invalid cycle count: {raw}"))?,
        None => DEFAULT_CYCLES,
    };
    let wind_mps = match args.next() {
        Some(raw) => raw.parse().map_err(|_| format!("invalid wind speed: {raw}"))?,
        None => DEFAULT_WIND_MPS,
    };
    Ok(Args { cycles, wind_mps })
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_report(report: &RangingReport) {
    let frame_len = report.to_frame().map(|f| f.len()).unwrap_or(0);
    let wind = match report.wind {
        Some(w) => format!("wind {:+.2} m/s, c {:.1} m/s", w.wind_mps, w.sound_speed_mps),
        None => "no wind estimate".to_string(),
    };
    println!(
        "[{:>10.3} ms] cycle {:>3}: A->B {:8.3} us  B->A {:8.3} us  {}  ({} byte frame)",
        report.timestamp_us as f64 / 1000.0,
        report.cycle,
        report.a_to_b.tof.tof_us,
        report.b_to_a.tof.tof_us,
        wind,
        frame_len,
    );
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("usage: anemo-simulator [cycles] [wind_mps]");
            return ExitCode::FAILURE;
        }
    };

    let mut config = AnemometerConfig::default();
    config.ranging.path_length_mm = Some(PATH_LENGTH_MM);

    let path = AcousticPath {
        length_m: PATH_LENGTH_MM as f64 / 1000.0,
        wind_mps: args.wind_mps,
        ..AcousticPath::default()
    };
    info!(
        "simulating {} cycles over {} mm, wind {} m/s",
        args.cycles, PATH_LENGTH_MM, args.wind_mps
    );

    let firmware = test_firmware();
    let rt = Runtime::new(MockPlatform::anemometer(&config, &firmware, path));
    let image = match FirmwareImage::new(&firmware) {
        Ok(image) => image,
        Err(e) => {
            error!("bad firmware image: {e}");
            return ExitCode::FAILURE;
        }
    };
    let anemometer = match Anemometer::new(&rt, &config, image) {
        Ok(anemometer) => anemometer,
        Err(e) => {
            error!("board setup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let finished = Cell::new(false);
    let failed = Cell::new(false);
    let tasks = TaskQueue::new();

    tasks.spawn(async {
        if let Err(e) = kick_watchdog(&rt, config.watchdog_period()).await {
            error!("watchdog kicker failed: {e}");
        }
    });
    tasks.spawn(async {
        let outcome = async {
            let calibration = anemometer.start().await?;
            info!("calibration: A {} B {}", calibration.a, calibration.b);
            anemometer.run(Some(args.cycles), print_report).await
        }
        .await;
        if let Err(e) = outcome {
            error!("ranging stopped: {e}");
            failed.set(true);
        }
        finished.set(true);
    });

    let max_passes = PASSES_PER_CYCLE * (args.cycles as usize + 1);
    if !rt.run_until(&tasks, max_passes, || finished.get() || rt.is_halted()) {
        error!("simulation did not finish within {} passes", max_passes);
        return ExitCode::FAILURE;
    }

    if let Some(reason) = rt.halt_reason() {
        error!("runtime halted: {:?}", reason);
        return ExitCode::FAILURE;
    }
    info!(
        "done at {} ms, {} watchdog kicks",
        rt.platform().now_us() / 1000,
        rt.platform().watchdog_kicks()
    );
    if failed.get() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
