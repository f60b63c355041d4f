#![forbid(unsafe_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{AUTHORIZATION, HOST};
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::localapi::broker::Broker;
use crate::utils::errors::Errors;
use crate::utils::hello_utils::{first_label, truncate_chars};

// ***************************************************************************
//                                Constants
// ***************************************************************************
// The daemon ignores the host, but http/1.1 requires one.
const LOCAL_API_HOST: &str = "local-tailscaled.sock";
pub const WHOIS_PATH: &str = "/localapi/v0/whois";

// Undecodable bodies are quoted in errors up to this many characters.
const MAX_BODY_IN_ERROR: usize = 200;

// ***************************************************************************
//                            Wire Representation
// ***************************************************************************
// Fields we don't use are carried along so --test-ip shows the whole record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct WhoIsResponse {
    #[serde(deserialize_with = "null_as_default")]
    pub node: Node,
    #[serde(deserialize_with = "null_as_default")]
    pub user_profile: UserProfile,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Node {
    #[serde(deserialize_with = "null_as_default")]
    pub computed_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub hostinfo: Hostinfo,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Hostinfo {
    #[serde(rename = "OS", deserialize_with = "null_as_default")]
    pub os: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct UserProfile {
    #[serde(deserialize_with = "null_as_default")]
    pub display_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub login_name: String,
    #[serde(rename = "ProfilePicURL", deserialize_with = "null_as_default")]
    pub profile_pic_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// An explicit null reads the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl WhoIsResponse {
    /// Tab indented JSON, as printed by --test-ip.
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

// ***************************************************************************
//                              IdentityRecord
// ***************************************************************************
/// What the page shows about the visitor.  Field names are the template's
/// variable names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRecord {
    #[serde(rename = "DisplayName")]
    pub display_name: String,
    #[serde(rename = "LoginName")]
    pub login_name: String,
    #[serde(rename = "ProfilePicURL")]
    pub profile_pic_url: String,
    #[serde(rename = "MachineName")]
    pub machine_name: String,
    #[serde(rename = "MachineOS")]
    pub machine_os: String,
    #[serde(rename = "IP")]
    pub ip: String,
}

impl IdentityRecord {
    pub fn from_who_is(who: &WhoIsResponse, ip: &str) -> Self {
        IdentityRecord {
            display_name: who.user_profile.display_name.clone(),
            login_name: who.user_profile.login_name.clone(),
            profile_pic_url: who.user_profile.profile_pic_url.clone(),
            machine_name: first_label(&who.node.computed_name).to_string(),
            machine_os: who.node.hostinfo.os.clone(),
            ip: ip.to_string(),
        }
    }

    /// Canned visitor shown in dev mode when the lookup fails.
    pub fn fixture() -> Self {
        IdentityRecord {
            display_name: "Taily Scalerson".to_string(),
            login_name: "taily@scaler.son".to_string(),
            profile_pic_url: "https://placekitten.com/200/200".to_string(),
            machine_name: "scaled".to_string(),
            machine_os: "Linux".to_string(),
            ip: "100.1.2.3".to_string(),
        }
    }
}

// ***************************************************************************
//                                 Resolver
// ***************************************************************************
/// Maps a caller's address to who they are.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn who_is(&self, ip: &str) -> Result<WhoIsResponse, Errors>;
}

// ---------------------------------------------------------------------------
// LocalClient:
// ---------------------------------------------------------------------------
/** Speaks http/1.1 to the local daemon over whatever channel the broker
 * finds.  One connection per call, no retries and no timeout.
 */
#[derive(Debug, Clone)]
pub struct LocalClient {
    broker: Broker,
}

impl LocalClient {
    pub fn new(broker: Broker) -> Self {
        LocalClient { broker }
    }

    // -----------------------------------------------------------------------
    // get:
    // -----------------------------------------------------------------------
    /** Issue a GET for path_and_query and return the status and full body. */
    async fn get(&self, path_and_query: &str) -> Result<(StatusCode, Bytes), Errors> {
        let channel = self.broker.connect().await?;

        let mut builder = hyper::Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .header(HOST, LOCAL_API_HOST);
        if let Some(token) = &channel.token {
            builder = builder.header(AUTHORIZATION, basic_auth("", token));
        }
        let req = builder.body(Empty::<Bytes>::new())?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(channel.stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("local API connection closed with error: {}", e);
            }
        });

        let res = sender.send_request(req).await?;
        let status = res.status();
        let body = res.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }
}

#[async_trait]
impl IdentityResolver for LocalClient {
    async fn who_is(&self, ip: &str) -> Result<WhoIsResponse, Errors> {
        let (status, body) = self.get(&whois_path(ip)).await?;
        if status != StatusCode::OK {
            return Err(Errors::Status(status.to_string(), String::from_utf8_lossy(&body).into_owned()));
        }
        decode_who_is(&body)
    }
}

// ***************************************************************************
//                             Public Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// decode_who_is:
// ---------------------------------------------------------------------------
/** Parse a whois body.  On failure the error quotes no more than the first
 * MAX_BODY_IN_ERROR characters of the body.
 */
pub fn decode_who_is(body: &[u8]) -> Result<WhoIsResponse, Errors> {
    serde_json::from_slice(body).map_err(|e| {
        debug!("whois decode: {}", e);
        let text = String::from_utf8_lossy(body);
        Errors::Decode(format!("{:?}", truncate_chars(&text, MAX_BODY_IN_ERROR)))
    })
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
fn whois_path(ip: &str) -> String {
    let ip: String = url::form_urlencoded::byte_serialize(ip.as_bytes()).collect();
    format!("{}?ip={}", WHOIS_PATH, ip)
}

fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}
