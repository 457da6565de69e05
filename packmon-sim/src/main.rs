//! Run the pack controller against simulated hardware: a deterministic
//! thermistor bank, a mock Daly BMS slave on a loopback serial link, and
//! scripted radio availability.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use packmon_controller::config::Config;
use packmon_controller::program::{Platform, Program};

mod mock_bms;
mod sim;

use mock_bms::{MockBmsLink, PackModel};

#[derive(Parser, Debug)]
#[command(name = "packmon-sim", about = "Pack controller on simulated hardware")]
struct Args {
    /// Directory for the KV store, telemetry log and calibration file
    #[arg(long, default_value = "./packmon-data")]
    data_dir: PathBuf,

    /// Scheduler tick in milliseconds (the firmware default is 5000)
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Number of ticks to run; 0 runs forever
    #[arg(long, default_value_t = 0)]
    ticks: u64,

    /// Simulated cell count reported by the mock BMS
    #[arg(long, default_value_t = 8)]
    cells: u8,

    /// Take the simulated websocket client down
    #[arg(long)]
    websocket_down: bool,

    /// Take the simulated MQTT broker down
    #[arg(long)]
    mqtt_down: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating {}", args.data_dir.display()))?;

    let kv = Rc::new(sim::FileKv::open(args.data_dir.join("kv.json")));
    let mut config = Config::load_or_default(kv.as_ref());
    config.program_interval_ms = args.interval_ms;
    config.storage.path = args.data_dir.join("data.log");
    config.calibration.path = args.data_dir.join("calibrations.json");
    config.validate();
    log::set_max_level(config.log_level.as_level_filter());

    let manager_model = PackModel {
        cells: args.cells,
        ..PackModel::default()
    };
    let balance_model = PackModel {
        cells: args.cells,
        soc_decipct: 865,
        ..PackModel::default()
    };

    let platform = Platform {
        mux: Box::new(sim::SimMux::new(5)),
        motors: Box::new(sim::SimMotorDriver::default()),
        reference: Box::new(sim::SimReference { celsius: 21.5 }),
        bms_manager_link: Box::new(MockBmsLink::new(manager_model)),
        bms_balance_link: Box::new(MockBmsLink::new(balance_model)),
        radio: Box::new(sim::SimRadio),
        websocket: Box::new(sim::SimWebsocket { up: !args.websocket_down }),
        mqtt: Box::new(sim::SimMqtt { up: !args.mqtt_down }),
        network: Box::new(sim::SimNetwork),
        mdns: Box::new(sim::SimMdns),
        webserver: Box::new(sim::SimWebServer),
        scanner: Box::new(sim::SimScanner::new(config.tpms.clone())),
        clock: Box::new(sim::SimClock::default()),
        fetcher: Box::new(sim::SimDateFetcher),
        manifest: Box::new(sim::SimManifest),
        watchdog: Box::new(sim::SimWatchdog::new(60 * 1000)),
        alarm_output: Box::new(sim::SimAlarmOutput::default()),
        probe: Box::new(sim::SimProbe),
        kv,
    };

    let mut program = Program::new(config, platform);
    program.begin();
    info!("packmon-sim: running, addr {}", program.address());

    if args.ticks == 0 {
        program.run();
    } else {
        program.run_for(args.ticks);
        info!("packmon-sim: finished {} ticks", args.ticks);
    }
    Ok(())
}
