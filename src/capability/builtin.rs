//! Built-in capabilities
//!
//! Small, self-contained capabilities that ship with the host. Real
//! deployments register their own alongside these.

use std::sync::Arc;

use rand::Rng;
use serde_json::{json, Value};

use super::registry::{CapabilityRegistry, RegistryError};
use super::{handler_fn, CallContext, CallRequest, CapabilityDescriptor, CapabilityError, MethodKind};

/// Source tag of the built-in capabilities
pub const BUILTIN_SOURCE: &str = "builtin";

const MAX_DICE: u32 = 100;
const MAX_SIDES: u32 = 1000;

/// Register (or re-register) every built-in capability
pub fn register_builtins(registry: &CapabilityRegistry) -> Result<Vec<String>, RegistryError> {
    registry.reload_source(BUILTIN_SOURCE, builtin_descriptors())
}

pub fn builtin_descriptors() -> Vec<CapabilityDescriptor> {
    vec![
        CapabilityDescriptor::new(
            "tool_echo",
            MethodKind::Tool,
            Arc::new(
                handler_fn(|req: CallRequest, _ctx: CallContext| async move { Ok(echo(req)) })
                    .with_usage("tool_echo(value) -> value. Returns its argument unchanged."),
            ),
        ),
        CapabilityDescriptor::new(
            "roll_dice",
            MethodKind::Tool,
            Arc::new(
                handler_fn(|req: CallRequest, _ctx: CallContext| async move {
                    let notation = req.str_arg(0, "notation").unwrap_or("1d6");
                    roll_dice(notation)
                })
                .with_usage(
                    "roll_dice(notation='1d6') -> {\"rolls\": [...], \"total\": n}. Notation is NdM, e.g. '2d20'.",
                ),
            ),
        ),
        CapabilityDescriptor::new(
            "send_message",
            MethodKind::Agent,
            Arc::new(
                handler_fn(|req: CallRequest, _ctx: CallContext| async move {
                    let text = req.str_arg(0, "text")?;
                    Ok::<_, CapabilityError>(json!({ "message": text }))
                })
                .with_usage(
                    "send_message(text). Sends text to the user and ends the program; \
                     the result starts a new reasoning turn.",
                ),
            ),
        ),
        CapabilityDescriptor::new(
            "set_timer",
            MethodKind::Behavior,
            Arc::new(
                handler_fn(|req: CallRequest, _ctx: CallContext| async move { set_timer(&req) })
                    .with_usage(
                        "set_timer(seconds, note=''). Schedules a reminder and ends the program; \
                         the reminder is kept as conversation context.",
                    ),
            ),
        ),
        CapabilityDescriptor::new(
            "file_info",
            MethodKind::Tool,
            Arc::new(
                handler_fn(|req: CallRequest, ctx: CallContext| async move {
                    let path = ctx.existing_shared_path(req.str_arg(0, "path")?).await?;
                    let meta = tokio::fs::symlink_metadata(&path).await?;
                    Ok::<_, CapabilityError>(json!({
                        "size": meta.len(),
                        "is_dir": meta.is_dir(),
                    }))
                })
                .with_usage("file_info(path) -> {\"size\": n, \"is_dir\": bool} for a file in the shared area."),
            ),
        ),
    ]
}

fn echo(req: CallRequest) -> Value {
    match (req.args.len(), req.kwargs.is_empty()) {
        (1, true) => req.args.into_iter().next().unwrap_or(Value::Null),
        (0, false) => req.kwargs.get("value").cloned().unwrap_or(Value::Object(req.kwargs)),
        (0, true) => Value::Null,
        _ => Value::Array(req.args),
    }
}

fn parse_dice(notation: &str) -> Result<(u32, u32), CapabilityError> {
    let invalid = || CapabilityError::InvalidArguments(format!("bad dice notation `{}`", notation));
    let lower = notation.trim().to_ascii_lowercase();
    let (count, sides) = lower.split_once('d').ok_or_else(invalid)?;
    let count: u32 = if count.is_empty() { 1 } else { count.parse().map_err(|_| invalid())? };
    let sides: u32 = sides.parse().map_err(|_| invalid())?;
    if count == 0 || count > MAX_DICE || sides < 2 || sides > MAX_SIDES {
        return Err(invalid());
    }
    Ok((count, sides))
}

fn roll_dice(notation: &str) -> Result<Value, CapabilityError> {
    let (count, sides) = parse_dice(notation)?;
    let mut rng = rand::thread_rng();
    let rolls: Vec<u32> = (0..count).map(|_| rng.gen_range(1..=sides)).collect();
    let total: u32 = rolls.iter().sum();
    Ok(json!({ "rolls": rolls, "total": total }))
}

fn set_timer(req: &CallRequest) -> Result<Value, CapabilityError> {
    let seconds = req
        .arg(0, "seconds")
        .and_then(Value::as_u64)
        .filter(|s| *s > 0)
        .ok_or_else(|| CapabilityError::InvalidArguments("`seconds` must be a positive integer".into()))?;
    let note = req.arg(1, "note").and_then(Value::as_str).unwrap_or("");
    let due_at = i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delay| chrono::Utc::now().checked_add_signed(delay))
        .ok_or_else(|| CapabilityError::InvalidArguments(format!("`seconds` is too large: {}", seconds)))?;
    Ok(json!({
        "timer": { "seconds": seconds, "note": note, "due_at": due_at.to_rfc3339() }
    }))
}
