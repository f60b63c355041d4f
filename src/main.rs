#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info};
use poem::listener::{Listener, RustlsCertificate, RustlsConfig, TcpListener};
use poem::{EndpointExt, Server};
use tokio::task::JoinSet;

// Hello Utilities
use crate::localapi::broker::Broker;
use crate::localapi::whois::{IdentityResolver, LocalClient};
use crate::utils::config::{get_parms, init_log, HelloArgs, RuntimeCtx};
use crate::utils::errors::Errors;
use crate::web::dispatch::{root, Dispatcher};
use crate::web::render::Renderer;

// Modules
mod localapi;
mod utils;
mod web;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const SERVER_NAME : &str = "HelloServer"; // for poem logging

// ---------------------------------------------------------------------------
// main:
// ---------------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<()> {
    // --------------- Initialize Hello ---------------
    let ctx = hello_init()?;
    let client = LocalClient::new(Broker::from_config(&ctx.parms.config));

    // Single lookup mode never starts a server.
    if !ctx.args.test_ip.is_empty() {
        return test_ip(&client, &ctx.args.test_ip).await;
    }

    // The embedded template is compiled here; dev mode defers to each request.
    let renderer = Renderer::new(ctx.mode, &ctx.parms.config).map_err(|e| {
        error!("{}", e);
        e
    })?;
    info!("Rendering in {:?} mode.", renderer.mode());
    let dispatcher = Arc::new(Dispatcher::from_ctx(&ctx, Arc::new(client), renderer));

    // ------------------ Main Loop -------------------
    info!("Starting hello server.");
    run_servers(&ctx, dispatcher).await
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// hello_init:
// ---------------------------------------------------------------------------
/** Parse the command line, read the configuration file and start logging.
 * The returned context is the only configuration the rest of the program
 * sees.
 */
fn hello_init() -> Result<RuntimeCtx> {
    let args = HelloArgs::parse();
    let parms = get_parms(&args)?;
    init_log(parms.config.log_config.as_deref())?;

    let ctx = RuntimeCtx::new(args, parms);
    info!("{}", Errors::InputParms(format!("{:#?}", ctx)));

    // Log build info.
    print_version_info();
    Ok(ctx)
}

// ---------------------------------------------------------------------------
// test_ip:
// ---------------------------------------------------------------------------
/** Look up one address and print the raw whois record to stdout. */
async fn test_ip(client: &LocalClient, ip: &str) -> Result<()> {
    let who = client.who_is(ip).await.map_err(|e| {
        error!("whois({:?}) error: {}", ip, e);
        e
    })?;
    println!("{}", who.to_pretty_json()?);
    Ok(())
}

// ---------------------------------------------------------------------------
// run_servers:
// ---------------------------------------------------------------------------
/** Run each configured listener as its own task.  Whichever finishes first,
 * for whatever reason, takes the process down with it.
 */
async fn run_servers(ctx: &RuntimeCtx, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let mut servers = JoinSet::new();

    if let Some(addr) = &ctx.http_addr {
        info!("running HTTP server on {}", addr);
        let server = Server::new(TcpListener::bind(addr.clone())).name(SERVER_NAME);
        servers.spawn(server.run(root.data(dispatcher.clone())));
    }

    if let Some(addr) = &ctx.https_addr {
        let config = &ctx.parms.config;
        let cert = std::fs::read(&config.cert_file)
            .with_context(|| format!("reading certificate {}", config.cert_file))?;
        let key = std::fs::read(&config.key_file)
            .with_context(|| format!("reading key {}", config.key_file))?;

        info!("running HTTPS server on {}", addr);
        let listener = TcpListener::bind(addr.clone()).rustls(
            RustlsConfig::new().fallback(RustlsCertificate::new().key(key).cert(cert)),
        );
        let server = Server::new(listener).name(SERVER_NAME);
        servers.spawn(server.run(root.data(dispatcher.clone())));
    }

    let result = match servers.join_next().await {
        None => Err(anyhow!("no listeners configured; set --http or --https")),
        Some(Ok(Ok(()))) => Err(anyhow!("server stopped")),
        Some(Ok(Err(e))) => Err(anyhow!(e).context("server failed")),
        Some(Err(e)) => Err(anyhow!(e).context("server task failed")),
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

// ---------------------------------------------------------------------------
// print_version_info:
// ---------------------------------------------------------------------------
fn print_version_info() {
    info!("\n*** Running HELLO={}, BRANCH={}, COMMIT={}, DIRTY={}, SRC_TS={}, RUSTC={}.",
          option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
          env!("GIT_BRANCH"),
          env!("GIT_COMMIT_SHORT"),
          env!("GIT_DIRTY"),
          env!("SOURCE_TIMESTAMP"),
          env!("RUSTC_VERSION"));
}
