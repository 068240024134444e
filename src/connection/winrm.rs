//! WinRM session implementation (WS-Management over HTTP/S).
//!
//! Windows targets are driven through WS-Man command shells: create a shell,
//! post a command, poll Receive for base64-encoded stdout/stderr streams
//! until the command reports Done, then signal and delete the shell. Shells
//! are short-lived - one per invocation - and are never pooled; only SSH
//! sessions are cached.
//!
//! Authentication is NTLMv2 over the Negotiate HTTP scheme. Kerberos is
//! accepted in configuration for forward compatibility but surfaces a typed
//! unsupported-auth error at request time rather than silently degrading.
//!
//! The command strings posted here are produced by
//! [`script::powershell`](crate::script::powershell); this module does not
//! escape or frame anything itself.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::config::{WinRmAuthScheme, WinRmSessionConfig};
use super::ntlm::NtlmCredentials;
use super::{CommandOutput, SessionError, SessionResult};

// WS-Management SOAP namespaces; fixed by the protocol.
const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const TERMINATE_SIGNAL: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Maximum SOAP envelope size advertised to the server.
const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Operation timeout advertised in each envelope, ISO-8601 duration form.
const OPERATION_TIMEOUT: &str = "PT60S";

/// UTF-8 code page for console output.
const CODEPAGE: u32 = 65_001;

/// A WinRM endpoint ready to run commands.
pub struct WinRmSession {
    config: WinRmSessionConfig,
    client: Client,
    ntlm: Option<NtlmCredentials>,
}

impl WinRmSession {
    /// Build a session for the given configuration.
    ///
    /// No network traffic happens here; the first command creates the remote
    /// shell.
    pub fn connect(config: WinRmSessionConfig) -> SessionResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .danger_accept_invalid_certs(config.skip_cert_checks)
            .build()
            .map_err(|e| SessionError::Establishment {
                host: config.host.clone(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        let ntlm = match config.auth_scheme {
            WinRmAuthScheme::Ntlm => Some(NtlmCredentials::new(
                &config.username,
                &config.password,
                config.domain.as_deref(),
            )),
            WinRmAuthScheme::Kerberos => None,
        };

        Ok(Self {
            config,
            client,
            ntlm,
        })
    }

    /// The configuration this session was built from.
    pub fn config(&self) -> &WinRmSessionConfig {
        &self.config
    }

    /// Execute one command line through a fresh shell.
    pub async fn execute(&self, command: &str) -> SessionResult<CommandOutput> {
        debug!(host = %self.config.host, "Executing WinRM command");

        let shell_id = self.create_shell().await?;
        let result: SessionResult<CommandOutput> = async {
            let command_id = self.post_command(&shell_id, command).await?;
            let output = self.receive_output(&shell_id, &command_id).await?;
            let _ = self.signal_terminate(&shell_id, &command_id).await;
            Ok(output)
        }
        .await;
        // The shell is deleted regardless of how the command fared.
        let _ = self.delete_shell(&shell_id).await;

        if let Ok(output) = &result {
            trace!(
                host = %self.config.host,
                exit_code = ?output.exit_code,
                stdout_len = output.stdout.len(),
                stderr_len = output.stderr.len(),
                "WinRM command completed"
            );
        }
        result
    }

    /// Create a remote cmd shell, returning its id.
    async fn create_shell(&self) -> SessionResult<String> {
        let environment = if self.config.environment.is_empty() {
            String::new()
        } else {
            let variables: String = self
                .config
                .environment
                .iter()
                .map(|(name, value)| {
                    format!(
                        "<rsp:Variable Name=\"{}\">{}</rsp:Variable>",
                        xml_escape(name),
                        xml_escape(value)
                    )
                })
                .collect();
            format!("<rsp:Environment>{}</rsp:Environment>", variables)
        };

        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{ACTION_CREATE}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>
    <w:OptionSet xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
      <w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>
      <w:Option Name="WINRS_CODEPAGE">{CODEPAGE}</w:Option>
    </w:OptionSet>
  </s:Header>
  <s:Body>
    <rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
      {environment}
    </rsp:Shell>
  </s:Body>
</s:Envelope>"#,
            endpoint = self.config.endpoint_url(),
            message_id = Uuid::new_v4(),
        );

        let body = self.send_checked(&envelope, "create shell").await?;
        let shell_id = extract_between(&body, "<rsp:ShellId>", "</rsp:ShellId>")
            .or_else(|| extract_between(&body, "ShellId\">", "</"))
            .ok_or_else(|| {
                SessionError::Channel("failed to parse shell id from response".to_string())
            })?;
        debug!(shell_id = %shell_id, "Created WinRM shell");
        Ok(shell_id)
    }

    /// Post a command into a shell, returning the command id.
    async fn post_command(&self, shell_id: &str, command: &str) -> SessionResult<String> {
        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{ACTION_COMMAND}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>
    <w:SelectorSet>
      <w:Selector Name="ShellId">{shell_id}</w:Selector>
    </w:SelectorSet>
  </s:Header>
  <s:Body>
    <rsp:CommandLine>
      <rsp:Command>{command}</rsp:Command>
    </rsp:CommandLine>
  </s:Body>
</s:Envelope>"#,
            endpoint = self.config.endpoint_url(),
            message_id = Uuid::new_v4(),
            command = xml_escape(command),
        );

        let body = self.send_checked(&envelope, "post command").await?;
        extract_between(&body, "<rsp:CommandId>", "</rsp:CommandId>").ok_or_else(|| {
            SessionError::Channel("failed to parse command id from response".to_string())
        })
    }

    /// Poll Receive until the command reports Done, accumulating output.
    async fn receive_output(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> SessionResult<CommandOutput> {
        let mut output = CommandOutput::default();
        loop {
            let envelope = format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{ACTION_RECEIVE}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>
    <w:SelectorSet>
      <w:Selector Name="ShellId">{shell_id}</w:Selector>
    </w:SelectorSet>
  </s:Header>
  <s:Body>
    <rsp:Receive>
      <rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>
  </s:Body>
</s:Envelope>"#,
                endpoint = self.config.endpoint_url(),
                message_id = Uuid::new_v4(),
            );

            let body = self.send_checked(&envelope, "receive output").await?;
            let done = parse_receive_body(&body, &mut output);
            if done {
                return Ok(output);
            }
        }
    }

    /// Signal command termination; failure is logged, not fatal.
    async fn signal_terminate(&self, shell_id: &str, command_id: &str) -> SessionResult<()> {
        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{ACTION_SIGNAL}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>
    <w:SelectorSet>
      <w:Selector Name="ShellId">{shell_id}</w:Selector>
    </w:SelectorSet>
  </s:Header>
  <s:Body>
    <rsp:Signal CommandId="{command_id}">
      <rsp:Code>{TERMINATE_SIGNAL}</rsp:Code>
    </rsp:Signal>
  </s:Body>
</s:Envelope>"#,
            endpoint = self.config.endpoint_url(),
            message_id = Uuid::new_v4(),
        );

        if let Err(e) = self.send_checked(&envelope, "signal terminate").await {
            warn!(shell_id = %shell_id, command_id = %command_id, error = %e, "Failed to signal command termination");
        }
        Ok(())
    }

    /// Delete the shell; failure is logged, not fatal.
    async fn delete_shell(&self, shell_id: &str) -> SessionResult<()> {
        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}">
  <s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{ACTION_DELETE}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>
    <w:SelectorSet>
      <w:Selector Name="ShellId">{shell_id}</w:Selector>
    </w:SelectorSet>
  </s:Header>
  <s:Body/>
</s:Envelope>"#,
            endpoint = self.config.endpoint_url(),
            message_id = Uuid::new_v4(),
        );

        match self.send_checked(&envelope, "delete shell").await {
            Ok(_) => {
                debug!(shell_id = %shell_id, "Deleted WinRM shell");
                Ok(())
            }
            Err(e) => {
                warn!(shell_id = %shell_id, error = %e, "Failed to delete shell");
                Ok(())
            }
        }
    }

    /// Send an envelope and fail on non-success HTTP status.
    async fn send_checked(&self, envelope: &str, operation: &str) -> SessionResult<String> {
        let response = self.send_request(envelope).await?;
        let status = response.status();
        let body = response.text().await.map_err(|e| SessionError::Channel(
            format!("failed to read {} response: {}", operation, e),
        ))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(SessionError::Channel(format!(
                "{} failed: {} - {}",
                operation, status, body
            )))
        }
    }

    /// Send an authenticated request according to the configured scheme.
    async fn send_request(&self, body: &str) -> SessionResult<Response> {
        match self.config.auth_scheme {
            WinRmAuthScheme::Ntlm => self.send_ntlm_request(body).await,
            WinRmAuthScheme::Kerberos => Err(SessionError::UnsupportedAuth(
                "Kerberos WinRM authentication requires GSSAPI support; use NTLM".to_string(),
            )),
        }
    }

    /// Run the two-leg NTLM handshake and post the body on the final leg.
    async fn send_ntlm_request(&self, body: &str) -> SessionResult<Response> {
        let url = self.config.endpoint_url();
        let host = &self.config.host;
        let ntlm = self.ntlm.as_ref().ok_or_else(|| {
            SessionError::Authentication {
                user: self.config.username.clone(),
                host: host.clone(),
                message: "NTLM credentials not initialized".to_string(),
            }
        })?;

        // Leg 1: Type 1 (Negotiate).
        let negotiate = BASE64.encode(ntlm.negotiate_message());
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Negotiate {}", negotiate))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| SessionError::Establishment {
                host: host.clone(),
                message: format!("NTLM negotiate failed: {}", e),
            })?;

        if response.status().as_u16() != 401 {
            return Err(SessionError::Authentication {
                user: self.config.username.clone(),
                host: host.clone(),
                message: format!(
                    "expected 401 challenge, got {}",
                    response.status()
                ),
            });
        }

        // Leg 2: parse the Type 2 challenge and answer with Type 3.
        let challenge_b64 = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Negotiate "))
            .ok_or_else(|| SessionError::Authentication {
                user: self.config.username.clone(),
                host: host.clone(),
                message: "no Negotiate challenge in 401 response".to_string(),
            })?
            .to_string();

        let challenge = BASE64
            .decode(challenge_b64.trim())
            .map_err(|e| SessionError::Authentication {
                user: self.config.username.clone(),
                host: host.clone(),
                message: format!("invalid challenge encoding: {}", e),
            })?;

        let authenticate = ntlm.authenticate_message(&challenge)?;
        self.client
            .post(&url)
            .header(
                "Authorization",
                format!("Negotiate {}", BASE64.encode(authenticate)),
            )
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| SessionError::Establishment {
                host: host.clone(),
                message: format!("NTLM authenticated request failed: {}", e),
            })
    }
}

impl std::fmt::Debug for WinRmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmSession")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("use_ssl", &self.config.use_ssl)
            .finish()
    }
}

/// Decode the stdout/stderr streams and exit code from a Receive response.
/// Returns `true` when the command state is Done.
fn parse_receive_body(body: &str, output: &mut CommandOutput) -> bool {
    for content in stream_contents(body, "stdout") {
        if let Ok(decoded) = BASE64.decode(content.trim()) {
            output.stdout.push_str(&String::from_utf8_lossy(&decoded));
        }
    }
    for content in stream_contents(body, "stderr") {
        if let Ok(decoded) = BASE64.decode(content.trim()) {
            output.stderr.push_str(&String::from_utf8_lossy(&decoded));
        }
    }
    if let Some(code) = extract_between(body, "<rsp:ExitCode>", "</rsp:ExitCode>") {
        if let Ok(code) = code.parse::<i32>() {
            output.exit_code = Some(code);
        }
    }
    body.contains("State=\"Done\"") || body.contains("CommandState=\"Done\"")
}

/// All `<rsp:Stream Name="...">` payloads of one stream in a response.
fn stream_contents<'a>(body: &'a str, stream: &str) -> Vec<&'a str> {
    let marker = format!("<rsp:Stream Name=\"{}\"", stream);
    let mut contents = Vec::new();
    let mut pos = 0;
    while let Some(start) = body[pos..].find(&marker) {
        let tag_start = pos + start;
        let Some(tag_end) = body[tag_start..].find('>') else { break };
        let content_start = tag_start + tag_end + 1;
        let Some(end) = body[content_start..].find("</rsp:Stream>") else { break };
        contents.push(&body[content_start..content_start + end]);
        pos = content_start + end;
    }
    contents
}

/// Text between the first occurrence of `start` and the following `end`.
fn extract_between(haystack: &str, start: &str, end: &str) -> Option<String> {
    let from = haystack.find(start)? + start.len();
    let len = haystack[from..].find(end)?;
    Some(haystack[from..from + len].to_string())
}

/// Escape special characters for XML content.
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_escape_covers_markup_characters() {
        assert_eq!(xml_escape("a & b"), "a &amp; b");
        assert_eq!(xml_escape("<x>"), "&lt;x&gt;");
        assert_eq!(xml_escape("\"q\""), "&quot;q&quot;");
    }

    #[test]
    fn extract_between_finds_first_span() {
        let body = "<rsp:ShellId>ABC-123</rsp:ShellId><rsp:ShellId>DEF</rsp:ShellId>";
        assert_eq!(
            extract_between(body, "<rsp:ShellId>", "</rsp:ShellId>").as_deref(),
            Some("ABC-123")
        );
        assert!(extract_between(body, "<missing>", "</missing>").is_none());
    }

    #[test]
    fn parse_receive_body_decodes_streams_and_exit_code() {
        let stdout_b64 = BASE64.encode("hello\n");
        let stderr_b64 = BASE64.encode("oops");
        let body = format!(
            "<rsp:Stream Name=\"stdout\" CommandId=\"c1\">{}</rsp:Stream>\
             <rsp:Stream Name=\"stderr\" CommandId=\"c1\">{}</rsp:Stream>\
             <rsp:CommandState CommandId=\"c1\" State=\"Done\">\
             <rsp:ExitCode>5</rsp:ExitCode></rsp:CommandState>",
            stdout_b64, stderr_b64
        );

        let mut output = CommandOutput::default();
        let done = parse_receive_body(&body, &mut output);
        assert!(done);
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "oops");
        assert_eq!(output.exit_code, Some(5));
    }

    #[test]
    fn parse_receive_body_accumulates_across_polls() {
        let mut output = CommandOutput::default();
        let first = format!(
            "<rsp:Stream Name=\"stdout\">{}</rsp:Stream>",
            BASE64.encode("part1 ")
        );
        let second = format!(
            "<rsp:Stream Name=\"stdout\">{}</rsp:Stream><rsp:CommandState State=\"Done\"/>",
            BASE64.encode("part2")
        );
        assert!(!parse_receive_body(&first, &mut output));
        assert!(parse_receive_body(&second, &mut output));
        assert_eq!(output.stdout, "part1 part2");
    }
}
