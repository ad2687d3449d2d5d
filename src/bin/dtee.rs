//! DTEE CLI: routers, compute nodes and attestation tooling
//!
//! Commands:
//!   dtee router  - route a service across its registered servers
//!   dtee serve   - run a compute node over gossipsub
//!   dtee keygen  - print a fresh key pair
//!   dtee image   - write a simulated enclave image
//!   dtee verify  - check an attestation report against an image
//!   dtee demo    - echo round trip through an in-process router

use dtee_core::codec::{FieldType, Value};
use dtee_core::config::Settings;
use dtee_core::context::{DteeConfig, DteeContext, Mode, Side};
use dtee_core::network::{GossipBus, LocalBus, SharedBus};
use dtee_core::router::Router;
use dtee_core::rpc::ServiceSchema;
use dtee_core::tee::{crypto, image, is_report_valid, make_key_pair, EnclaveRuntime, Report, SimulatedRuntime};
use log::{error, info};
use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

fn print_usage() {
    println!(
        r#"
DTEE v{}: Distributed Trusted Execution Environment

Usage: dtee <command> [options]

Commands:
  router  <service>                            Route calls for a service
  serve   [config.json]                        Run a compute node over gossipsub
  keygen                                       Print a fresh secp256k1 key pair
  image   <name> <hex-measurement>             Write a simulated enclave image
  verify  <report> <pubkey> <sig> <image>      Verify an attestation report
  demo                                         Echo round trip through a router

Environment:
  DTEE_RETRY_COUNT, DTEE_RETRY_INTERVAL_MS, DTEE_ENCLAVE_DIR, DTEE_LOCAL_TEE
  RUST_LOG (default: info)
"#,
        env!("CARGO_PKG_VERSION")
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let outcome = match args[1].as_str() {
        "router" => cmd_router(&args[2..]).await,
        "serve" => cmd_serve(&args[2..]).await,
        "keygen" => cmd_keygen(),
        "image" => cmd_image(&args[2..]),
        "verify" => cmd_verify(&args[2..]),
        "demo" => cmd_demo().await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Err("unknown command".to_string())
        }
    };

    if let Err(e) = outcome {
        error!("{}", e);
        process::exit(1);
    }
}

type CmdResult = Result<(), String>;

fn load_settings(path: Option<&String>) -> Result<Settings, String> {
    let settings = match path {
        Some(path) => Settings::load(path),
        None => Ok(Settings::default()),
    };
    settings
        .and_then(Settings::apply_env)
        .map_err(|e| format!("Cannot load settings: {}", e))
}

fn start_gossip(settings: &Settings) -> Result<SharedBus, String> {
    let (bus, _task) = GossipBus::start(&settings.network).map_err(|e| format!("Cannot start gossipsub: {}", e))?;
    info!("Peer ID: {}", bus.peer_id());
    let bus: SharedBus = bus;
    Ok(bus)
}

async fn wait_for_ctrl_c() -> CmdResult {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;
    info!("Shutting down");
    Ok(())
}

async fn cmd_router(args: &[String]) -> CmdResult {
    let service = args
        .first()
        .ok_or_else(|| "Usage: dtee router <service>".to_string())?;
    let settings = load_settings(args.get(1))?;
    let bus = start_gossip(&settings)?;

    let router = Router::start(bus, service, &settings.transport).map_err(|e| e.to_string())?;
    info!("Routing '{}'. Press Ctrl+C to stop.", router.service());
    wait_for_ctrl_c().await?;

    let backends = router.backends();
    println!("{}", serde_json::to_string_pretty(&backends).map_err(|e| e.to_string())?);
    Ok(())
}

async fn cmd_serve(args: &[String]) -> CmdResult {
    let settings = load_settings(args.first())?;
    let bus = start_gossip(&settings)?;

    let runtime: Arc<dyn EnclaveRuntime> = Arc::new(SimulatedRuntime::new());
    let context = DteeContext::new(
        DteeConfig::new(Side::Server, Mode::ComputeNode),
        settings,
        bus,
        Some(runtime),
    );
    let published = context.serve().await.map_err(|e| e.to_string())?;
    info!("Compute node up with {} services. Press Ctrl+C to stop.", published);
    wait_for_ctrl_c().await?;

    for (name, served) in context.served().await {
        println!("  {:<24} {} calls", name, served);
    }
    Ok(())
}

fn cmd_keygen() -> CmdResult {
    let pair = make_key_pair();
    let out = serde_json::json!({
        "private_key": hex::encode(pair.private_key()),
        "public_key": hex::encode(pair.public_key()),
    });
    println!("{}", serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?);
    Ok(())
}

fn cmd_image(args: &[String]) -> CmdResult {
    let (name, measurement) = match args {
        [name, measurement, ..] => (name, measurement),
        _ => return Err("Usage: dtee image <name> <hex-measurement>".into()),
    };
    let measurement: [u8; crypto::HASH_SIZE] = hex::decode(measurement)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| format!("Measurement must be {} hex-encoded bytes", crypto::HASH_SIZE))?;

    let settings = load_settings(None)?;
    let path = image::write_image(&settings.tee.enclave_dir, name, &measurement).map_err(|e| e.to_string())?;
    println!("  Wrote {}", path.display());
    Ok(())
}

fn decode_hex<const N: usize>(what: &str, text: &str) -> Result<[u8; N], String> {
    hex::decode(text)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| format!("{} must be {} hex-encoded bytes", what, N))
}

fn cmd_verify(args: &[String]) -> CmdResult {
    let [report, pub_key, signature, image_path, ..] = args else {
        return Err("Usage: dtee verify <report> <pubkey> <sig> <image>".into());
    };
    let raw = std::fs::read(report).map_err(|e| format!("Cannot read {}: {}", report, e))?;
    let report = Report::from_bytes(&raw).map_err(|e| e.to_string())?;
    let pub_key = decode_hex::<{ crypto::PUBLIC_KEY_SIZE }>("Public key", pub_key)?;
    let signature = decode_hex::<{ crypto::SIGNATURE_SIZE }>("Signature", signature)?;

    if is_report_valid(&report, &pub_key, &signature, Path::new(image_path)) {
        println!("  Report valid (nonce {})", report.enclave.nonce);
        Ok(())
    } else {
        Err("Report rejected".into())
    }
}

async fn cmd_demo() -> CmdResult {
    println!("\n  DTEE demo: echo through a router");
    println!("  {}", "=".repeat(50));

    let bus = LocalBus::shared();
    let mut settings = Settings::default();
    settings.tee.local_tee = Some(false);
    settings.transport.detect_timeout_ms = 200;
    let schema = || ServiceSchema::new(vec![FieldType::I32], Some(FieldType::I32));

    let router = Router::start(bus.clone(), "echo", &settings.transport).map_err(|e| e.to_string())?;

    let mut servers = Vec::new();
    for _ in 0..2 {
        let server = DteeContext::new(DteeConfig::new(Side::Server, Mode::Normal), settings.clone(), bus.clone(), None);
        server.publish_secure_function("echo", schema(), |args| Ok(Some(args[0].clone())));
        server.serve().await.map_err(|e| e.to_string())?;
        servers.push(server);
    }
    println!("  Router sees {} backends", router.live_backends());

    let client = DteeContext::new(DteeConfig::new(Side::Client, Mode::Normal), settings, bus, None);
    for n in [7, 42, 1024] {
        let reply = client
            .call_secure_function("echo", &schema(), &[Value::I32(n)], false)
            .await
            .map_err(|e| e.to_string())?;
        println!("  echo({}) -> {:?}", n, reply);
    }

    for (i, server) in servers.iter().enumerate() {
        for (name, served) in server.served().await {
            println!("  server {} served {} x{}", i, name, served);
        }
    }
    println!("  Client calls: {}", client.rpc().call_count("echo").await);
    Ok(())
}
