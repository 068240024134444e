//! PowerShell command framing for WinRM.
//!
//! WinRM posts command lines through a cmd shell with a bounded line length
//! and shell metacharacter interpretation, so arbitrary multi-line scripts
//! cannot be sent as-is. Two mutually exclusive strategies cover the gap:
//!
//! - [`EncodingStrategy::Encoded`]: base64 the whole script (with a strict
//!   error preamble) and send one decode-and-`Invoke-Expression` line.
//! - [`EncodingStrategy::DiskScript`]: escape the script for PowerShell
//!   double-quoted literals, append it line by line to a temp file on the
//!   target via `[IO.File]::AppendAllText`, batched into groups of 20
//!   commands to respect remote command-length limits, then invoke the file.
//!
//! Whichever strategy runs, the script is never executed un-escaped:
//! mis-handling `$`, `"`, `|` or `&` truncates or misinterprets the remote
//! command, which is a correctness failure, not a cosmetic one.
//!
//! The generated fragments (`$ErrorActionPreference="Stop"`,
//! `Invoke-Command {...}`, `[IO.File]::AppendAllText/WriteAllBytes`,
//! `[System.Convert]::FromBase64String`, `Remove-Item`) are the wire contract
//! with the remote Windows host and must not drift.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use regex::Regex;
use std::sync::OnceLock;

/// Strict-error preamble prepended to every framed script.
pub const PS_PREAMBLE: &str = "$ErrorActionPreference=\"Stop\"";

/// The PowerShell invocation prefix.
pub const PS_INVOKE: &str = "powershell";

/// Per-line append commands are batched in groups of this size.
pub const COMMAND_BATCH_SIZE: usize = 20;

/// Raw bytes per chunk when materializing file content remotely; base64
/// expansion keeps the resulting command under the envelope limit.
const FILE_CHUNK_SIZE: usize = 48 * 1024;

/// How a script reaches the remote shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingStrategy {
    /// Single base64-encoded `Invoke-Expression` line.
    Encoded,
    /// Write the script to a remote temp file line by line, then invoke it.
    DiskScript,
}

impl EncodingStrategy {
    /// Strategy selected by a session configuration flag.
    pub fn from_disable_flag(disable_command_encoding: bool) -> Self {
        if disable_command_encoding {
            EncodingStrategy::DiskScript
        } else {
            EncodingStrategy::Encoded
        }
    }
}

/// Frame a script as one base64-encoded invocation.
pub fn encoded_command(script: &str) -> String {
    let wrapped = format!("{}\n{}", PS_PREAMBLE, script);
    let encoded = BASE64.encode(wrapped.as_bytes());
    format!(
        "{} Invoke-Command -command {{Invoke-Expression ([System.Text.Encoding]::UTF8.GetString([System.Convert]::FromBase64String(\"{}\")))}}",
        PS_INVOKE, encoded
    )
}

fn pipe_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w)\|(\w)").expect("static pattern"))
}

fn ampersand_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w)&(\w)").expect("static pattern"))
}

/// Escape a script for the disk-script strategy.
///
/// `$` and `"` are escaped unconditionally for PowerShell double-quoted
/// literal safety. `|` and `&` are escaped only when gated between word
/// characters: that distinguishes metacharacters inside command tokens from
/// the same characters sitting in already-quoted literals, which must pass
/// through untouched. Characters adjacent to punctuation keep their original
/// (inconsistent) treatment; callers depend on that behavior.
pub fn escape_for_disk_script(script: &str) -> String {
    let escaped = script.replace('$', "`$").replace('"', "`\"");
    let escaped = pipe_pattern().replace_all(&escaped, "${1}`\"|`\"${2}");
    let escaped = ampersand_pattern().replace_all(&escaped, "${1}^&${2}");
    escaped.into_owned()
}

/// Build the batched per-line append commands that materialize `script` at
/// `script_file` on the target.
///
/// The preamble is prepended before escaping so the assembled file starts
/// with it. Every batch holds exactly [`COMMAND_BATCH_SIZE`] commands except
/// possibly the last.
pub fn disk_script_append_commands(script: &str, script_file: &str) -> Vec<Vec<String>> {
    let wrapped = format!("{}\n{}", PS_PREAMBLE, script);
    let escaped = escape_for_disk_script(&wrapped);

    let commands: Vec<String> = escaped
        .split('\n')
        .map(|line| {
            format!(
                "{} Invoke-Command -command {{[IO.File]::AppendAllText(\"{}\", \"{}`r`n\" ) }}",
                PS_INVOKE,
                script_file,
                line.trim_end_matches('\r')
            )
        })
        .collect();

    commands
        .chunks(COMMAND_BATCH_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Invoke the assembled script file.
pub fn invoke_script_command(script_file: &str) -> String {
    format!("{} -f \"{}\"", PS_INVOKE, script_file)
}

/// Best-effort removal of the temp script file, framed through the same
/// strategy that wrote it.
pub fn cleanup_command(script_file: &str, strategy: EncodingStrategy) -> String {
    let remove = format!("Remove-Item -Path \"{}\"", script_file);
    match strategy {
        EncodingStrategy::Encoded => encoded_command(&remove),
        EncodingStrategy::DiskScript => format!(
            "{} Invoke-Command -command {{Remove-Item -Path `\"{}`\"}}",
            PS_INVOKE, script_file
        ),
    }
}

/// Commands that materialize `content` at `dest_path` on the target.
///
/// Small content round-trips through a single
/// `[IO.File]::WriteAllBytes`/`FromBase64String` pair; larger content writes
/// the first chunk the same way and appends the rest through a file stream so
/// no single command exceeds the envelope limit.
pub fn write_file_commands(dest_path: &str, content: &[u8]) -> Vec<String> {
    let mut commands = Vec::new();
    for (index, chunk) in content.chunks(FILE_CHUNK_SIZE).enumerate() {
        let encoded = BASE64.encode(chunk);
        let command = if index == 0 {
            format!(
                "{} Invoke-Command -command {{[IO.File]::WriteAllBytes(\"{}\", [System.Convert]::FromBase64String(\"{}\"))}}",
                PS_INVOKE, dest_path, encoded
            )
        } else {
            format!(
                "{} Invoke-Command -command {{$fs = [System.IO.File]::Open(\"{}\", [System.IO.FileMode]::Append); $bytes = [System.Convert]::FromBase64String(\"{}\"); $fs.Write($bytes, 0, $bytes.Length); $fs.Close()}}",
                PS_INVOKE, dest_path, encoded
            )
        };
        commands.push(command);
    }
    if commands.is_empty() {
        // Zero-length content still truncates the destination file.
        commands.push(format!(
            "{} Invoke-Command -command {{[IO.File]::WriteAllBytes(\"{}\", [System.Convert]::FromBase64String(\"\"))}}",
            PS_INVOKE, dest_path
        ));
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encoded_command_wraps_preamble_and_script() {
        let command = encoded_command("Get-Process");
        assert!(command.starts_with("powershell Invoke-Command -command {Invoke-Expression"));
        assert!(command.contains("[System.Convert]::FromBase64String"));

        let payload = BASE64.encode(format!("{}\nGet-Process", PS_PREAMBLE));
        assert!(command.contains(&payload));
    }

    #[test]
    fn dollars_and_quotes_are_always_escaped() {
        let escaped = escape_for_disk_script("$env:Path = \"C:\\bin\"");
        assert!(!escaped.contains('$') || escaped.contains("`$"));
        assert_eq!(escaped, "`$env:Path = `\"C:\\bin`\"");
    }

    #[test]
    fn pipe_between_word_characters_is_wrapped() {
        let escaped = escape_for_disk_script("abc|def");
        assert_eq!(escaped, "abc`\"|`\"def");
    }

    #[test]
    fn ampersand_between_word_characters_is_caret_escaped() {
        let escaped = escape_for_disk_script("abc&def");
        assert_eq!(escaped, "abc^&def");
    }

    #[test]
    fn pipe_without_adjacent_word_characters_passes_through() {
        // Inside an already-quoted literal the pipe sits next to spaces and
        // escaped quotes, never word characters.
        let escaped = escape_for_disk_script("echo \" | \"");
        assert!(escaped.contains(" | "));
        assert!(!escaped.contains("`\"|`\""));
    }

    #[test]
    fn append_commands_are_batched_in_twenties() {
        // 45 script lines plus the preamble line = 46 commands.
        let script = (0..45)
            .map(|i| format!("Write-Output line{}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let batches = disk_script_append_commands(&script, "C:\\temp\\run.ps1");

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), COMMAND_BATCH_SIZE);
        assert_eq!(batches[1].len(), COMMAND_BATCH_SIZE);
        assert_eq!(batches[2].len(), 6);
        assert!(batches[0][0].contains("[IO.File]::AppendAllText(\"C:\\temp\\run.ps1\""));
        // The preamble is the first appended line, escaped.
        assert!(batches[0][0].contains("ErrorActionPreference"));
    }

    #[test]
    fn batch_count_is_exact_for_multiples_of_twenty() {
        // 19 script lines plus the preamble = exactly one batch.
        let script = vec!["Write-Output x"; 19].join("\n");
        let batches = disk_script_append_commands(&script, "f.ps1");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), COMMAND_BATCH_SIZE);
    }

    #[test]
    fn appended_lines_carry_crlf_terminator() {
        let batches = disk_script_append_commands("Write-Output hi", "f.ps1");
        for command in batches.iter().flatten() {
            assert!(command.contains("`r`n"));
        }
    }

    #[test]
    fn invoke_command_references_the_script_file() {
        assert_eq!(
            invoke_script_command("C:\\temp\\run.ps1"),
            "powershell -f \"C:\\temp\\run.ps1\""
        );
    }

    #[test]
    fn cleanup_follows_the_writing_strategy() {
        let encoded = cleanup_command("f.ps1", EncodingStrategy::Encoded);
        assert!(encoded.contains("FromBase64String"));
        let payload = BASE64.encode(format!("{}\nRemove-Item -Path \"f.ps1\"", PS_PREAMBLE));
        assert!(encoded.contains(&payload));

        let plain = cleanup_command("f.ps1", EncodingStrategy::DiskScript);
        assert_eq!(
            plain,
            "powershell Invoke-Command -command {Remove-Item -Path `\"f.ps1`\"}"
        );
    }

    #[test]
    fn small_files_round_trip_through_a_single_write() {
        let commands = write_file_commands("C:\\app\\app.config", b"some-bytes");
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("[IO.File]::WriteAllBytes(\"C:\\app\\app.config\""));
        assert!(commands[0].contains(&BASE64.encode(b"some-bytes")));
    }

    #[test]
    fn large_files_append_after_the_first_chunk() {
        let content = vec![0xAAu8; 100 * 1024];
        let commands = write_file_commands("C:\\app\\blob.bin", &content);
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("WriteAllBytes"));
        assert!(commands[1].contains("FileMode]::Append"));
        assert!(commands[2].contains("FileMode]::Append"));
    }

    #[test]
    fn empty_content_still_truncates_the_destination() {
        let commands = write_file_commands("C:\\app\\empty.txt", b"");
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("WriteAllBytes"));
    }

    #[test]
    fn strategy_selection_follows_the_disable_flag() {
        assert_eq!(
            EncodingStrategy::from_disable_flag(false),
            EncodingStrategy::Encoded
        );
        assert_eq!(
            EncodingStrategy::from_disable_flag(true),
            EncodingStrategy::DiskScript
        );
    }
}
