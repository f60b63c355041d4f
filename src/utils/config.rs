#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{info, LevelFilter};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::Deserialize;
use std::{env, fs};

use crate::utils::{errors::Errors, hello_utils};

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Configuration file lookup.
const ENV_HELLO_CONFIG       : &str = "HELLO_CONFIG";
const DEFAULT_CONFIG_FILE    : &str = "/etc/hello/hello.toml";

// TLS material for the secured listener.
const DEFAULT_CERT_FILE      : &str = "/etc/hello/hello.ipn.dev.crt";
const DEFAULT_KEY_FILE       : &str = "/etc/hello/hello.ipn.dev.key";

// Template read on every request in dev mode, relative to the working directory.
const DEFAULT_TEMPLATE_FILE  : &str = "templates/hello.tmpl.html";

// Local API endpoints.
const DEFAULT_SOCKET_PATH    : &str = "/var/run/tailscale/tailscaled.sock";
#[cfg(target_os = "macos")]
const DEFAULT_TOKEN_DIR      : Option<&str> = Some("~/Library/Group Containers/*.io.tailscale.ipn.macos");
#[cfg(not(target_os = "macos"))]
const DEFAULT_TOKEN_DIR      : Option<&str> = None;

// Plain http requests arriving on this address are redirected to the public name.
const DEFAULT_VIRTUAL_IP     : &str = "100.101.102.103";
const DEFAULT_PUBLIC_HOSTNAME: &str = "hello.ipn.dev";

// Console log pattern used when no log4rs file is configured.
const DEFAULT_LOG_PATTERN    : &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l})} {t} - {m}{n}";

// ***************************************************************************
//                               Config Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// HelloArgs:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Parser)]
#[command(name = "hello_server", version, about = "Greets tailnet visitors by name.")]
pub struct HelloArgs {
    /// Address to run an HTTP server on, or empty for none.
    #[arg(long, default_value = ":80")]
    pub http: String,

    /// Address to run an HTTPS server on, or empty for none.
    #[arg(long, default_value = ":443")]
    pub https: String,

    /// If non-empty, look up this IP, print the result as JSON and exit
    /// before running a server.
    #[arg(long, default_value = "")]
    pub test_ip: String,

    /// TOML configuration file.
    ///
    /// When absent, the HELLO_CONFIG environment variable and then
    /// /etc/hello/hello.toml are tried.  A missing file means defaults.
    #[arg(short, long)]
    pub config: Option<String>,
}

// ---------------------------------------------------------------------------
// Parms:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct Parms {
    pub config_file: String,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// Config:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cert_file: String,
    pub key_file: String,
    pub template_file: String,
    pub socket_path: String,
    pub token_dir: Option<String>,
    pub virtual_ip: String,
    pub public_hostname: String,
    pub log_config: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Expand ~ and environment variables in every path setting.
    fn expand_paths(mut self) -> Self {
        self.cert_file = hello_utils::expand_path(&self.cert_file);
        self.key_file = hello_utils::expand_path(&self.key_file);
        self.template_file = hello_utils::expand_path(&self.template_file);
        self.socket_path = hello_utils::expand_path(&self.socket_path);
        self.token_dir = self.token_dir.map(|d| hello_utils::expand_path(&d));
        self.log_config = self.log_config.map(|f| hello_utils::expand_path(&f));
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cert_file: DEFAULT_CERT_FILE.to_string(),
            key_file: DEFAULT_KEY_FILE.to_string(),
            template_file: DEFAULT_TEMPLATE_FILE.to_string(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            token_dir: DEFAULT_TOKEN_DIR.map(str::to_string),
            virtual_ip: DEFAULT_VIRTUAL_IP.to_string(),
            public_hostname: DEFAULT_PUBLIC_HOSTNAME.to_string(),
            log_config: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RenderMode:
// ---------------------------------------------------------------------------
/** Dev mode re-reads the template from disk on each request and substitutes
 * canned identity data when the lookup fails.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Dev,
    Production,
}

impl RenderMode {
    /// Dev mode is a plain http server with no https listener.
    pub fn from_addrs(http: &str, https: &str) -> Self {
        if https.trim().is_empty() && !http.trim().is_empty() {
            RenderMode::Dev
        } else {
            RenderMode::Production
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeCtx:
// ---------------------------------------------------------------------------
/** Everything decided at startup.  Built once in main and handed to the
 * components that need it; never mutated afterwards.
 */
#[derive(Debug, Clone)]
pub struct RuntimeCtx {
    pub args: HelloArgs,
    pub parms: Parms,
    pub mode: RenderMode,
    pub http_addr: Option<String>,
    pub https_addr: Option<String>,
}

impl RuntimeCtx {
    pub fn new(args: HelloArgs, parms: Parms) -> Self {
        let mode = RenderMode::from_addrs(&args.http, &args.https);
        let http_addr = hello_utils::listen_addr(&args.http);
        let https_addr = hello_utils::listen_addr(&args.https);
        RuntimeCtx { args, parms, mode, http_addr, https_addr }
    }
}

// ***************************************************************************
//                               Log Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_log:
// ---------------------------------------------------------------------------
/** Initialize log4rs from the configured file, or log to stderr at info level
 * when no file is configured.  Stdout is left alone for --test-ip output.
 */
pub fn init_log(log_config: Option<&str>) -> Result<()> {
    match log_config {
        Some(logconfig) => {
            if let Err(e) = log4rs::init_file(logconfig, Default::default()) {
                eprintln!("{}", e);
                return Err(anyhow!(Errors::Log4rsInitialization(logconfig.to_string())));
            }
            info!("Log4rs initialized using: {}", logconfig);
        }
        None => {
            let stderr = ConsoleAppender::builder()
                .target(Target::Stderr)
                .encoder(Box::new(PatternEncoder::new(DEFAULT_LOG_PATTERN)))
                .build();
            let config = LogConfig::builder()
                .appender(Appender::builder().build("stderr", Box::new(stderr)))
                .build(Root::builder().appender("stderr").build(LevelFilter::Info))?;
            log4rs::init_config(config)?;
        }
    }
    Ok(())
}

// ***************************************************************************
//                             Parms Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_parms:
// ---------------------------------------------------------------------------
/** Retrieve the application parameters from the configuration file specified
 * either on the command line or through an environment variable.  If neither
 * are provided, an attempt is made to use the default file path.  A file that
 * cannot be read yields the default configuration; one that cannot be parsed
 * is an error.
 */
pub fn get_parms(args: &HelloArgs) -> Result<Parms> {
    let config_file = match &args.config {
        Some(f) => f.clone(),
        None => env::var(ENV_HELLO_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string()),
    };
    let config_file = hello_utils::expand_path(&config_file);

    // Logging is not up yet, so report on stderr.
    eprintln!("{}", Errors::ReadingConfigFile(config_file.clone()));
    let contents = match fs::read_to_string(&config_file) {
        Ok(c) => c,
        Err(_) => {
            eprintln!("Unable to read configuration at {}. Using default values.", config_file);
            return Ok(Parms { config_file: Default::default(), config: Config::new().expand_paths() });
        }
    };

    let config = parse_config(&contents).map_err(|e| {
        anyhow!("{}\n   {}", Errors::TOMLParseError(config_file.clone()), e)
    })?;

    Ok(Parms { config_file, config })
}

// ---------------------------------------------------------------------------
// parse_config:
// ---------------------------------------------------------------------------
fn parse_config(contents: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(contents).map(Config::expand_paths)
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> HelloArgs {
        let mut v = vec!["hello_server"];
        v.extend_from_slice(extra);
        HelloArgs::parse_from(v)
    }

    #[test]
    fn default_args() {
        let a = args(&[]);
        assert_eq!(a.http, ":80");
        assert_eq!(a.https, ":443");
        assert_eq!(a.test_ip, "");
        assert!(a.config.is_none());
    }

    #[test]
    fn empty_https_selects_dev_mode() {
        let ctx = RuntimeCtx::new(args(&["--https", "", "--http", ":8080"]), Parms { config_file: String::new(), config: Config::new() });
        assert_eq!(ctx.mode, RenderMode::Dev);
        assert_eq!(ctx.https_addr, None);
        assert_eq!(ctx.http_addr.as_deref(), Some("[::]:8080"));
    }

    #[test]
    fn render_mode_rules() {
        assert_eq!(RenderMode::from_addrs(":80", ":443"), RenderMode::Production);
        assert_eq!(RenderMode::from_addrs("", ":443"), RenderMode::Production);
        assert_eq!(RenderMode::from_addrs(":80", ""), RenderMode::Dev);
        // Nothing to serve is not dev mode.
        assert_eq!(RenderMode::from_addrs("", ""), RenderMode::Production);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let c = parse_config("public_hostname = \"hello.example.com\"\nsocket_path = \"/tmp/ts.sock\"\n").unwrap();
        assert_eq!(c.public_hostname, "hello.example.com");
        assert_eq!(c.socket_path, "/tmp/ts.sock");
        assert_eq!(c.virtual_ip, DEFAULT_VIRTUAL_IP);
        assert_eq!(c.cert_file, DEFAULT_CERT_FILE);
    }

    #[test]
    fn bad_config_is_rejected() {
        assert!(parse_config("virtual_ip = 42").is_err());
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let p = get_parms(&args(&["--config", "/nonexistent/hello.toml"])).unwrap();
        assert_eq!(p.config_file, "");
        assert_eq!(p.config.template_file, DEFAULT_TEMPLATE_FILE);
    }
}
