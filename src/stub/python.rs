//! Python rendering of a [`StubModule`]

use std::fmt::Write;

use super::{StubModule, ENV_BRIDGE_URL, ENV_CONVERSATION_KEY, ENV_RUN_ID, ENV_SANDBOX_ID, SENTINEL_CLOSE, SENTINEL_OPEN};
use crate::rpc::envelope::CALL_PATH;

/// Request timeout used by stubs, in seconds
const CALL_TIMEOUT_SECS: u32 = 300;

/// Render the preamble prepended to every program
///
/// Output is deterministic for a given module, so the preamble line count
/// used to remap traceback line numbers is stable.
pub fn render(module: &StubModule) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str(&client_source());

    for method in &module.methods {
        // Names are validated identifiers, usage is JSON-escaped, which is a
        // valid Python string literal.
        let _ = writeln!(
            out,
            "{name} = _codevisor_method({name_lit}, {kind_lit}, {doc_lit})",
            name = method.name,
            name_lit = py_str(&method.name),
            kind_lit = py_str(method.kind.as_str()),
            doc_lit = method.usage.as_deref().map(py_str).unwrap_or_else(|| "None".to_string()),
        );
    }
    out.push_str("del _codevisor_method\n");
    out.push_str("# --- end of capability stubs ---\n");
    out
}

fn py_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn client_source() -> String {
    format!(
        r#"# --- capability stubs (generated, do not edit) ---
import http.client as _cv_http
import json as _cv_json
import os as _cv_os
import socket as _cv_socket
import sys as _cv_sys
import urllib.parse as _cv_parse


class CapabilityCallError(RuntimeError):
    pass


class _UnixConnection(_cv_http.HTTPConnection):
    def __init__(self, path, timeout):
        super().__init__("localhost", timeout=timeout)
        self._path = path

    def connect(self):
        sock = _cv_socket.socket(_cv_socket.AF_UNIX, _cv_socket.SOCK_STREAM)
        sock.settimeout(self.timeout)
        sock.connect(self._path)
        self.sock = sock


class _CapabilityClient:
    def __init__(self):
        env = _cv_os.environ
        self._url = env.get("{url}", "")
        self._headers = {{
            "content-type": "application/json",
            "x-codevisor-conversation-key": _cv_os.environb.get(b"{key}", b"").hex(),
            "x-codevisor-sandbox-id": env.get("{sandbox}", ""),
            "x-codevisor-run-id": env.get("{run}", ""),
        }}

    def _connect(self):
        if self._url.startswith("unix://"):
            return _UnixConnection(self._url[len("unix://"):], {timeout}), "{path}"
        parts = _cv_parse.urlsplit(self._url)
        conn = _cv_http.HTTPConnection(parts.hostname or "", parts.port, timeout={timeout})
        return conn, parts.path.rstrip("/") + "{path}"

    def call(self, name, kind, args, kwargs):
        body = _cv_json.dumps(
            {{"capability_name": name, "args": list(args), "kwargs": kwargs}}, default=str
        ).encode("utf-8")
        try:
            conn, path = self._connect()
            try:
                conn.request("POST", path, body=body, headers=self._headers)
                response = conn.getresponse()
                status = response.status
                raw = response.read()
                failed = response.getheader("x-codevisor-error", "0") == "1"
                kind = response.getheader("x-codevisor-method-kind", kind)
            finally:
                conn.close()
        except (OSError, _cv_http.HTTPException) as exc:
            raise CapabilityCallError("%s: host unreachable (%s)" % (name, exc)) from None
        if status != 200:
            raise CapabilityCallError("%s: call rejected by host (HTTP %d)" % (name, status))
        payload = _cv_json.loads(raw.decode("utf-8"))
        if failed:
            raise CapabilityCallError("%s: %s" % (name, payload.get("error")))
        value = payload.get("value")
        if kind == "tool":
            return value
        _cv_sys.stdout.write("{open} kind=%s name=%s>>>\n" % (kind, name))
        _cv_sys.stdout.write(_cv_json.dumps(value) + "\n")
        _cv_sys.stdout.write("{close}\n")
        _cv_sys.stdout.flush()
        _cv_sys.stderr.flush()
        _cv_os._exit(0)


_codevisor = _CapabilityClient()


def _codevisor_method(name, kind, doc):
    def method(*args, **kwargs):
        return _codevisor.call(name, kind, args, kwargs)

    method.__name__ = name
    method.__doc__ = doc
    return method


"#,
        url = ENV_BRIDGE_URL,
        key = ENV_CONVERSATION_KEY,
        sandbox = ENV_SANDBOX_ID,
        run = ENV_RUN_ID,
        path = CALL_PATH,
        timeout = CALL_TIMEOUT_SECS,
        open = SENTINEL_OPEN,
        close = SENTINEL_CLOSE,
    )
}
