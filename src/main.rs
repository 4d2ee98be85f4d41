use std::env;
use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::EnvFilter;

use remu::{
    AddressMapper, Config, DramConfig, FaultModel, Injector, ProcPageMap, Region, RemuError,
    Result, SegmentTable, Translator,
};

const USAGE: &str = "usage: remu <mapping.yaml> <fault-model-file> [line] [flip-bit]";
const DEMO_REGION: usize = 64 << 20;
const LUT_FILE: &str = "pd_lut";

fn arg<T: std::str::FromStr>(args: &[String], i: usize, name: &str, default: T) -> Result<T> {
    match args.get(i) {
        Some(s) => s
            .parse()
            .map_err(|_| RemuError::InvalidConfig(format!("bad {name} `{s}`"))),
        None => Ok(default),
    }
}

fn run(args: &[String]) -> Result<()> {
    let [mapping, model_file, ..] = args else {
        return Err(RemuError::InvalidConfig(USAGE.into()));
    };
    let line: usize = arg(args, 2, "line", 1)?;
    let flip_bit: u8 = arg(args, 3, "flip bit", 0)?;

    let dram = DramConfig::load(mapping)?;
    info!("\n{dram}");
    let capacity = dram.hardware_capacity;
    let model = FaultModel::load(model_file, line)?;
    info!(%model, bits = model.total_bits(), "fault model");

    let mut config = Config::new(Box::new(AddressMapper::new(dram)?));
    config.flip_bit = flip_bit;
    config.dram_capacity = capacity;
    config.seed = env::var("REMU_SEED").ok().and_then(|s| s.parse().ok());

    let mut region = Region::populate(DEMO_REGION)?;
    let pages = ProcPageMap::open_self()?;
    let segments = SegmentTable::load()?;
    segments.save_lut(LUT_FILE)?;

    let injector = Injector::new(&config, Translator::new(&pages, &segments));
    let mut rng = injector.rng();
    let mut mem = region.mem_map();
    let plan = injector.plan(mem.base(), mem.len() as u64, &model, &mut rng)?;
    for (spec, found) in &plan.yields {
        info!(num = spec.num, cnt = spec.cnt, "sampled {found:?}");
    }
    for report in injector.apply(&plan, &mut mem) {
        println!("{report}");
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("remu: {e}");
            ExitCode::from(1)
        }
    }
}
