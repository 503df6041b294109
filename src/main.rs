use anyhow::Result;
use clap::Parser;
use nix::unistd::geteuid;
use sockprobe::cli::Cli;
use sockprobe::config::SuiteConfig;
use sockprobe::netns::IpTool;
use sockprobe::property::PropertyRegistry;
use sockprobe::report;
use sockprobe::scenario::{ScenarioContext, ScenarioKind};
use sockprobe::testcase::TestSuite;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; `RUST_LOG` overrides the level
fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn load_config(cli: &Cli) -> Result<SuiteConfig> {
    let mut config = match &cli.config {
        Some(path) => SuiteConfig::from_file(path)?,
        None => SuiteConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    debug!("Configuration: {:?}", config);
    Ok(config)
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let registry = PropertyRegistry::standard();

    if args.list_scenarios {
        for kind in ScenarioKind::ALL {
            println!("{}", kind);
        }
        return Ok(ExitCode::SUCCESS);
    }
    if args.list_properties {
        println!("{}", serde_json::to_string_pretty(registry.descriptors())?);
        return Ok(ExitCode::SUCCESS);
    }

    let testcases = args.testcase_filter();
    let scenarios = args.scenario_filter()?;
    let mut suite = TestSuite::discover(&config, &registry, testcases.as_deref(), scenarios.as_deref())?;

    if args.list_testcases {
        for testcase in suite.testcases() {
            println!("{}", testcase.name());
        }
        return Ok(ExitCode::SUCCESS);
    }
    if args.deps {
        for dependency in suite.dependencies()? {
            println!("{}", dependency);
        }
        return Ok(ExitCode::SUCCESS);
    }

    if !geteuid().is_root() {
        eprintln!("You have to be root to run the test driver. Please use sudo.");
        return Ok(ExitCode::FAILURE);
    }

    let network = IpTool::default();
    let ctx = ScenarioContext {
        config: &config,
        network: &network,
    };
    let result = suite.run(&ctx)?;
    suite.save(&args.outdir)?;
    print!("{}", report::render(&suite));

    Ok(if result {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
