//! Stub generation
//!
//! Turns a registry snapshot into the client interface a sandboxed program
//! links against: one callable per capability, each forwarding its call to
//! the RPC bridge instead of running locally.
//!
//! Routing data (bridge URL, conversation key, sandbox id, run id) never
//! appears in generated source. It is handed to the program through its
//! environment when the run starts, so the same rendered module is correct
//! for any sandbox it lands in and nothing secret is baked into code.

pub mod python;

use std::sync::Arc;

use crate::capability::{CapabilityDescriptor, CapabilityRegistry, MethodKind};
use crate::conversation::ConversationKey;
use crate::sandbox::PROGRAM_FILE;

pub const ENV_BRIDGE_URL: &str = "CODEVISOR_BRIDGE_URL";
pub const ENV_CONVERSATION_KEY: &str = "CODEVISOR_CONVERSATION_KEY";
pub const ENV_SANDBOX_ID: &str = "CODEVISOR_SANDBOX_ID";
pub const ENV_RUN_ID: &str = "CODEVISOR_RUN_ID";

pub const SENTINEL_OPEN: &str = "<<<CODEVISOR_RESULT";
pub const SENTINEL_CLOSE: &str = "<<<END_CODEVISOR_RESULT>>>";

/// One proxy symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubMethod {
    pub name: String,
    pub kind: MethodKind,
    pub usage: Option<String>,
}

/// Language-neutral client interface compiled from a registry snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubModule {
    pub methods: Vec<StubMethod>,
}

impl StubModule {
    pub fn from_snapshot(snapshot: &[Arc<CapabilityDescriptor>]) -> Self {
        Self {
            methods: snapshot
                .iter()
                .map(|d| StubMethod {
                    name: d.name.clone(),
                    kind: d.kind,
                    usage: d.usage.clone(),
                })
                .collect(),
        }
    }

    pub fn method(&self, name: &str) -> Option<&StubMethod> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Where a stub must call back to, for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubRouting {
    pub bridge_url: String,
    pub conversation_key: ConversationKey,
    pub sandbox_id: String,
    pub run_id: String,
}

impl StubRouting {
    /// Environment variables the program is started with
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_BRIDGE_URL.to_string(), self.bridge_url.clone()),
            (ENV_CONVERSATION_KEY.to_string(), self.conversation_key.as_str().to_string()),
            (ENV_SANDBOX_ID.to_string(), self.sandbox_id.clone()),
            (ENV_RUN_ID.to_string(), self.run_id.clone()),
        ]
    }

    /// Inverse of [`env`](Self::env), used by runners inside the sandbox
    pub fn from_env_vars<I, K, V>(vars: I) -> Option<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let (mut url, mut key, mut sandbox, mut run) = (None, None, None, None);
        for (k, v) in vars {
            match k.as_ref() {
                ENV_BRIDGE_URL => url = Some(v.into()),
                ENV_CONVERSATION_KEY => key = Some(v.into()),
                ENV_SANDBOX_ID => sandbox = Some(v.into()),
                ENV_RUN_ID => run = Some(v.into()),
                _ => {}
            }
        }
        Some(Self {
            bridge_url: url?,
            conversation_key: ConversationKey::new(key?),
            sandbox_id: sandbox?,
            run_id: run?,
        })
    }
}

/// Program ready to be written into a sandbox
#[derive(Debug, Clone)]
pub struct ProgramBundle {
    /// Stub preamble followed by the untrusted body
    pub source: String,
    pub env: Vec<(String, String)>,
    /// Lines the preamble adds in front of the body
    pub preamble_lines: usize,
    /// The untrusted body as submitted
    pub body: String,
}

impl ProgramBundle {
    /// Rewrite `program.py", line N` references so N counts body lines
    ///
    /// References into the preamble are left as they are.
    pub fn remap_line_numbers(&self, output: &str) -> String {
        let needle = format!("{}\", line ", PROGRAM_FILE);
        let mut out = String::with_capacity(output.len());
        let mut rest = output;

        while let Some(pos) = rest.find(&needle) {
            let (head, tail) = rest.split_at(pos + needle.len());
            out.push_str(head);
            let digits = tail.bytes().take_while(|b| b.is_ascii_digit()).count();
            match tail[..digits].parse::<usize>() {
                Ok(line) if line > self.preamble_lines => {
                    out.push_str(&(line - self.preamble_lines).to_string())
                }
                _ => out.push_str(&tail[..digits]),
            }
            rest = &tail[digits..];
        }
        out.push_str(rest);
        out
    }
}

/// Builds per-run program bundles from the live registry
#[derive(Clone)]
pub struct StubGenerator {
    registry: Arc<CapabilityRegistry>,
}

impl StubGenerator {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Compile the current registry contents
    pub fn module(&self) -> StubModule {
        StubModule::from_snapshot(&self.registry.snapshot())
    }

    /// Preamble + body for one run against one sandbox
    pub fn materialize(&self, body: &str, routing: &StubRouting) -> ProgramBundle {
        let preamble = python::render(&self.module());
        let preamble_lines = preamble.lines().count();
        let mut source = String::with_capacity(preamble.len() + body.len() + 1);
        source.push_str(&preamble);
        source.push_str(body);
        if !body.ends_with('\n') {
            source.push('\n');
        }
        ProgramBundle {
            source,
            env: routing.env(),
            preamble_lines,
            body: body.to_string(),
        }
    }
}

/// A sentinel-wrapped result printed by a short-circuiting stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelBlock {
    pub kind: MethodKind,
    pub name: String,
    pub body: String,
}

/// Wrap a short-circuit result the way stubs print it
pub fn render_sentinel(kind: MethodKind, name: &str, body: &str) -> String {
    format!(
        "{} kind={} name={}>>>\n{}\n{}\n",
        SENTINEL_OPEN,
        kind.as_str(),
        name,
        body,
        SENTINEL_CLOSE
    )
}

/// Extract every sentinel block from captured output
pub fn parse_sentinels(output: &str) -> Vec<SentinelBlock> {
    let mut blocks = Vec::new();
    let mut rest = output;

    while let Some(start) = rest.find(SENTINEL_OPEN) {
        let after_open = &rest[start + SENTINEL_OPEN.len()..];
        let Some(header_end) = after_open.find(">>>") else { break };
        let header = &after_open[..header_end];

        let mut kind = None;
        let mut name = None;
        for field in header.split_whitespace() {
            if let Some(v) = field.strip_prefix("kind=") {
                kind = MethodKind::parse(v);
            } else if let Some(v) = field.strip_prefix("name=") {
                name = Some(v.to_string());
            }
        }

        let content = &after_open[header_end + 3..];
        let Some(close) = content.find(SENTINEL_CLOSE) else { break };
        if let (Some(kind), Some(name)) = (kind, name) {
            blocks.push(SentinelBlock {
                kind,
                name,
                body: content[..close].trim_matches('\n').to_string(),
            });
        }
        rest = &content[close + SENTINEL_CLOSE.len()..];
    }

    blocks
}
