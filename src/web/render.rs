#![forbid(unsafe_code)]

use std::path::PathBuf;

use tera::{Context, Tera};

use crate::localapi::whois::IdentityRecord;
use crate::utils::config::{Config, RenderMode};
use crate::utils::errors::Errors;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// The .html suffix turns on tera's autoescaping.
pub const TEMPLATE_NAME: &str = "hello.tmpl.html";
pub const EMBEDDED_TEMPLATE: &str = include_str!("../../templates/hello.tmpl.html");

// ***************************************************************************
//                                 Renderer
// ***************************************************************************
/** Turns an identity into the greeting page.  In dev mode the template is
 * re-read from disk on every call so it can be edited while the server runs;
 * otherwise the embedded copy is compiled once at startup.
 */
#[derive(Debug)]
pub enum Renderer {
    Dev { template_file: PathBuf },
    Production { tera: Tera },
}

impl Renderer {
    pub fn new(mode: RenderMode, config: &Config) -> Result<Self, Errors> {
        match mode {
            RenderMode::Dev => Ok(Self::dev(&config.template_file)),
            RenderMode::Production => Self::production(EMBEDDED_TEMPLATE),
        }
    }

    pub fn dev(template_file: impl Into<PathBuf>) -> Self {
        Renderer::Dev { template_file: template_file.into() }
    }

    /// Compile source once; empty or unparsable source is rejected.
    pub fn production(source: &str) -> Result<Self, Errors> {
        if source.trim().is_empty() {
            return Err(Errors::EmptyTemplate);
        }
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, source)?;
        Ok(Renderer::Production { tera })
    }

    pub fn mode(&self) -> RenderMode {
        match self {
            Renderer::Dev { .. } => RenderMode::Dev,
            Renderer::Production { .. } => RenderMode::Production,
        }
    }

    // -----------------------------------------------------------------------
    // render:
    // -----------------------------------------------------------------------
    pub async fn render(&self, data: &IdentityRecord) -> Result<String, Errors> {
        let ctx = Context::from_serialize(data)?;
        match self {
            Renderer::Dev { template_file } => {
                let source = tokio::fs::read_to_string(template_file).await.map_err(|e| {
                    Errors::Template(format!("reading {}: {}", template_file.display(), e))
                })?;
                Ok(Tera::one_off(&source, &ctx, true)?)
            }
            Renderer::Production { tera } => Ok(tera.render(TEMPLATE_NAME, &ctx)?),
        }
    }
}
