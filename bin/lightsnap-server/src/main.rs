// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use lightsnap_server::{
    config,
    fleet::FleetScheduler,
    hypervisor::sim::SimHypervisor,
    lifecycle::InstanceLifecycle,
    server::{self, DropshotEndpointContext},
    store::InMemoryChainStore,
};

use anyhow::{anyhow, Context};
use clap::Parser;
use dropshot::{ConfigDropshot, HandlerTaskMode, HttpServerStarter};
use slog::{info, o};

/// Threads to spawn for tokio runtime handling the API (dropshot, etc)
const API_RT_THREADS: usize = 4;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// An HTTP server for managing light snapshots across a fleet
enum Args {
    /// Generates the OpenAPI specification.
    OpenApi,
    /// Runs the light-snapshot server.
    Run {
        #[clap(action)]
        cfg: PathBuf,

        #[clap(name = "LIGHTSNAP_IP:PORT", action)]
        listen_addr: SocketAddr,

        /// Logging level for the server
        #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
        log_level: slog::Level,
    },
}

pub fn run_openapi() -> Result<(), String> {
    server::api()
        .openapi(
            "Light Snapshot Controller API",
            semver::Version::new(0, 0, 1),
        )
        .description(
            "API for taking, committing and recovering light snapshots of \
            instances across a fleet of compute hosts.",
        )
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

fn run_server(
    config: config::Config,
    config_dropshot: dropshot::ConfigDropshot,
    log: slog::Logger,
) -> anyhow::Result<()> {
    let api_runtime = {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.worker_threads(API_RT_THREADS).thread_name("tokio-rt-api");
        oxide_tokio_rt::build(&mut builder)?
    };
    let _guard = api_runtime.enter();

    let hypervisor = SimHypervisor::new(
        config::sim_latency(&config),
        log.new(o!("component" => "sim-hypervisor")),
    );
    for host in &config.sim.failing_hosts {
        hypervisor.fail_host(host.clone());
    }

    let directory = Arc::new(config::static_fleet(&config));
    let lifecycle = Arc::new(InstanceLifecycle::new(
        Arc::new(InMemoryChainStore::new()),
        Arc::new(hypervisor),
        directory.clone(),
        config::lifecycle_settings(&config),
        log.new(o!("component" => "lifecycle")),
    ));
    let fleet = Arc::new(FleetScheduler::new(
        directory,
        lifecycle.clone(),
        config::fleet_settings(&config),
        log.new(o!("component" => "fleet")),
    ));

    let context = DropshotEndpointContext::new(
        lifecycle,
        fleet.clone(),
        log.new(o!("component" => "api")),
    );

    info!(log, "Starting server...";
          "hosts" => config.hosts.len(),
          "address" => %config_dropshot.bind_address);

    let server = HttpServerStarter::new(
        &config_dropshot,
        server::api(),
        Arc::new(context),
        &log,
    )
    .map_err(|error| anyhow!("Failed to start server: {}", error))?
    .start();

    let result = api_runtime.block_on(server);

    // Abandon whatever batches are still waiting on the hypervisor.
    fleet.shutdown();

    result.map_err(|e| anyhow!("Server exited with an error: {}", e))
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("lightsnap-server", std::io::stdout())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let (dtrace_drain, probe_reg) = slog_dtrace::Dtrace::new();

    let filtered_main = slog::LevelFilter::new(main_drain, level);

    let log = slog::Logger::root(
        slog::Duplicate::new(filtered_main.fuse(), dtrace_drain.fuse()).fuse(),
        slog::o!(),
    );

    if let slog_dtrace::ProbeRegistration::Failed(err) = probe_reg {
        slog::error!(&log, "Error registering slog-dtrace probes: {:?}", err);
    }

    log
}

fn main() -> anyhow::Result<()> {
    // Command line arguments.
    let args = Args::parse();

    match args {
        Args::OpenApi => run_openapi()
            .map_err(|e| anyhow!("Cannot generate OpenAPI spec: {}", e)),
        Args::Run { cfg, listen_addr, log_level } => {
            let config = config::parse(&cfg).with_context(|| {
                format!("Failed to parse config file {}", cfg.display())
            })?;

            // Dropshot configuration.
            let config_dropshot = ConfigDropshot {
                bind_address: listen_addr,
                default_handler_task_mode: HandlerTaskMode::Detached,
                ..Default::default()
            };

            let log = build_logger(log_level);

            run_server(config, config_dropshot, log)
        }
    }
}
