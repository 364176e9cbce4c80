use std::{collections::HashMap, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::FutureExt;
use gantry::{
    adapters::{
        AutoRegistration, FileConfigProvider, GatewayConfigurationReceiver, HyperTransportFactory,
        InMemoryDiscovery, RequestIdHeader, default_error_responder,
    },
    app::{AppContext, ExitReason},
    config::{
        GantryConfig, GantryConfigValidator, RouterTableValidator, loader::load_config,
    },
    core::{GatewayOptions, GatewayRouter},
    ports::{
        config_provider::{ConfigValue, ConfigurationReceiver, ROUTER_TABLE_DATA_ID},
        registry::RegisterParam,
    },
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "gantry.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file and the routing table it points to
    Validate {
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
    /// Write a starter configuration and routing table
    Init {
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    GantryConfigValidator::validate(&config).map_err(|e| eyre!("Invalid configuration: {e}"))?;

    let log_levels = tracing_setup::init_tracing(&config.log)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    tracing::info!("Loaded configuration from {config_path}");

    let app = AppContext::new(&config.app);
    if let Err(e) = boot(&app, &config, log_levels).await {
        tracing::error!("Boot failed: {:?}", e);
        let report = app.shutdown().await;
        if !report.is_clean() {
            tracing::warn!("Cleanup after failed boot was not clean: {:?}", report);
        }
        return Err(e);
    }

    let exit = app.wait_for_exit().await;
    let report = app.shutdown().await;

    if let ExitReason::Error(e) = exit {
        return Err(e);
    }
    if !report.is_clean() {
        return Err(eyre!(
            "Shutdown finished with {} release errors and {} hook errors",
            report.release.errors.len(),
            report.hook_errors.len()
        ));
    }
    Ok(())
}

/// Wire every component into `app`; anything collected is released by the caller.
async fn boot(
    app: &AppContext,
    config: &GantryConfig,
    log_levels: tracing_setup::LogLevelHandle,
) -> Result<()> {
    let discovery = Arc::new(InMemoryDiscovery::with_services(
        config.discovery.services.clone(),
    ));
    let receiver = Arc::new(GatewayConfigurationReceiver::new(
        app.observers(),
        Some(log_levels),
    ));

    if let Some(path) = &config.dynamic_config {
        let provider = FileConfigProvider::dynamic_config(path, receiver.clone())
            .await
            .with_context(|| format!("Failed to load dynamic config {path}"))?;
        app.collect("dynamic-config", provider);
    }

    let table_provider = FileConfigProvider::routing_table(&config.routing_table, receiver.clone())
        .await
        .with_context(|| format!("Failed to load routing table {}", config.routing_table))?;
    app.collect("routing-table", table_provider);

    let table = match receiver.recently_configure(ROUTER_TABLE_DATA_ID) {
        Some(ConfigValue::RouterTable(table)) => table,
        _ => {
            return Err(eyre!(
                "Routing table {} could not be decoded",
                config.routing_table
            ));
        }
    };
    RouterTableValidator::validate(&table).map_err(|e| eyre!("Invalid routing table: {e}"))?;

    let dev_mode = app.profile().is_dev();
    let options = GatewayOptions::new(
        discovery.clone(),
        Arc::new(HyperTransportFactory),
        default_error_responder(dev_mode),
    )
    .with_extra(config.discovery.extra())
    .with_response_modifier(Arc::new(RequestIdHeader))
    .with_dev_mode(dev_mode);

    let router = GatewayRouter::start(
        table.to_route_items(),
        &config.server,
        app.reporter(),
        options,
    )
    .await
    .context("Failed to start gateway")?;
    router.observe(&app.observers());
    app.collect("gateway-router", router.clone());

    if let Some(addr) = &config.app.advertise_addr {
        let registration = AutoRegistration::new(
            discovery.clone(),
            RegisterParam {
                service_name: config.app.name.clone(),
                addr: addr.clone(),
                weight: 1.0,
                metadata: HashMap::new(),
                extra: config.discovery.extra(),
            },
        );
        app.collect("auto-registration", Arc::new(registration));
    }

    let observers = app.observers();
    app.add_pre_hook(
        "observers",
        Box::new(move |_deadline| {
            async move {
                observers.unregister_all();
                Ok(())
            }
            .boxed()
        }),
    );

    tracing::info!(
        "{} serving {} routes on {:?}",
        app.name(),
        router.services().await.len(),
        router.local_addr()
    );
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use gantry::config::loader::load_router_table;

    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = GantryConfigValidator::validate(&config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        println!();
        println!("💡 Common fixes:");
        println!("   • Verify listen and advertise addresses use 'IP:PORT'");
        println!("   • Timeouts, body_limit and concurrency must be greater than 0");
        println!("   • Seeded instances need an ip and a non-zero port");
        std::process::exit(1);
    }
    println!("✅ Configuration validation: OK");

    let table = match load_router_table(&config.routing_table).await {
        Ok(table) => table,
        Err(e) => {
            eprintln!("❌ Routing table '{}' failed to load:", config.routing_table);
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = RouterTableValidator::validate(&table) {
        eprintln!("❌ Routing table validation failed:");
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("✅ Routing table validation: OK");

    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.server.listen_addr());
    println!("   • Profile: {:?}", config.app.profile);
    println!("   • Routes: {}", table.tables.len());
    println!("   • Seeded Services: {}", config.discovery.services.len());
    println!(
        "   • Registration: {}",
        config.app.advertise_addr.as_deref().unwrap_or("disabled")
    );
    println!();
    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}

/// Write a starter configuration next to a routing table
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }
    let table_path = path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(ROUTER_TABLE_DATA_ID);

    let default_config = format!(
        r#"# Gantry gateway configuration

app:
  name: "gantry"
  profile: "dev"
  graceful_exit_timeout_mills: 30000
  # advertise_addr: "10.0.0.10:8080"

server:
  host: "0.0.0.0"
  port: 8080
  reload_shutdown_timeout_mills: 30000
  request_timeout_mills: 11000

discovery:
  group_name: "DEFAULT_GROUP"
  services:
    orders:
      - ip: "127.0.0.1"
        port: 3000

routing_table: "{}"
# dynamic_config: "dynamic-config.yaml"

log:
  level: "info"
  json: false
"#,
        table_path.display()
    );

    let default_table = r#"{
  "commonUpstreamClientCfg": {
    "maxConns": 256,
    "readTimeoutMills": 10500,
    "writeTimeoutMills": 10500
  },
  "tables": [
    {
      "id": "orders",
      "matchRule": {"type": "path_rewrite", "path": "/api/orders/**", "args": {"depth": "2"}}
    }
  ]
}
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");

    if table_path.exists() {
        println!("   Keeping existing routing table {}", table_path.display());
    } else {
        tokio::fs::write(&table_path, default_table)
            .await
            .context("Failed to write routing table")?;
        println!("✅ Created routing table at: {}", table_path.display());
    }
    println!("   Run 'gantry serve --config {config_path}' to start the gateway");
    Ok(())
}
