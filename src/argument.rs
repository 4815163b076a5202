//! Argument extractor (component E): turns a Hook's `pass-arguments`,
//! `pass-environment`, and `pass-file` lists into argv, envv, and file-backed
//! arguments for the Executor, subject to the configured safety ceilings.

use crate::hook::{Argument, ArgumentSource, Hook};
use crate::param;
use crate::request::ParsedRequest;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandValidationError {
    #[error("argument exceeds max length ({len} > {max})")]
    ArgumentTooLong { len: usize, max: usize },
    #[error("cumulative argument length exceeds max ({len} > {max})")]
    TotalLengthExceeded { len: usize, max: usize },
    #[error("argument count exceeds max ({count} > {max})")]
    TooManyArguments { count: usize, max: usize },
    #[error("argument contains a disallowed shell meta-character: {0:?}")]
    DisallowedCharacter(char),
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_arg_length: usize,
    pub max_total_args_length: usize,
    pub max_args_count: usize,
    pub strict_mode: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_arg_length: 8192,
            max_total_args_length: 65536,
            max_args_count: 256,
            strict_mode: false,
        }
    }
}

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '\n', '<', '>', '(', ')', '{', '}',
];

pub struct ExtractedCommand {
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    pub file_args: Vec<FileArg>,
}

pub struct FileArg {
    pub env_name: String,
    pub data: Vec<u8>,
}

/// Resolve one [`Argument`] against the request, honoring `base64decode`.
/// A missing parameter is not fatal here: the caller substitutes an empty
/// string so argv length stays stable with the hook's declared argument list
/// (spec §4.5).
pub fn resolve_value(arg: &Argument, req: &ParsedRequest) -> (String, bool /* found */) {
    let raw: Option<String> = match arg.source {
        ArgumentSource::Header => req.header(&arg.name).map(str::to_string),
        ArgumentSource::Url => param::extract_string(&arg.name, &req.query).ok(),
        ArgumentSource::Payload => req
            .raw_files
            .get(&arg.name)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .or_else(|| param::extract_string(&arg.name, &req.payload).ok()),
        ArgumentSource::String => Some(arg.name.clone()),
        ArgumentSource::Request => req.pseudo_field(&arg.name).map(str::to_string),
        ArgumentSource::EntirePayload => Some(req.payload.stringify()),
        ArgumentSource::EntireQuery => Some(req.query.stringify()),
        ArgumentSource::EntireHeaders => Some(req.entire_headers().stringify()),
        ArgumentSource::RawRequestBody => Some(String::from_utf8_lossy(&req.body).into_owned()),
    };

    let found = raw.is_some();
    let value = raw.unwrap_or_default();
    let value = if arg.base64_decode {
        decode_base64_lossy(&value)
    } else {
        value
    };
    (value, found)
}

fn decode_base64_lossy(s: &str) -> String {
    match base64::decode(s) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            log::warn!(target: "hookforge::argument", "base64 decode failed, passing raw value");
            s.to_string()
        }
    }
}

/// Build argv, envv, and file-args for `hook` against `req`, enforcing the
/// configured safety ceilings before returning anything to the Executor.
pub fn extract(
    hook: &Hook,
    req: &ParsedRequest,
    limits: &Limits,
) -> Result<ExtractedCommand, CommandValidationError> {
    let mut argv = vec![hook.execute_command.clone()];
    let mut total_len = 0usize;

    if hook.pass_arguments.len() > limits.max_args_count {
        return Err(CommandValidationError::TooManyArguments {
            count: hook.pass_arguments.len(),
            max: limits.max_args_count,
        });
    }

    for arg in &hook.pass_arguments {
        let (value, found) = resolve_value(arg, req);
        if !found {
            log::warn!(
                target: "hookforge::argument",
                "argument {:?}.{} not found, substituting empty string",
                arg.source,
                arg.name
            );
        }
        validate_argument(&value, limits)?;
        total_len += value.len();
        if total_len > limits.max_total_args_length {
            return Err(CommandValidationError::TotalLengthExceeded {
                len: total_len,
                max: limits.max_total_args_length,
            });
        }
        argv.push(value);
    }

    let mut envv = Vec::new();
    for arg in &hook.pass_environment {
        let (value, _found) = resolve_value(arg, req);
        envv.push(format!("{}={}", arg.env_key(), value));
    }

    let mut file_args = Vec::new();
    for arg in &hook.pass_file {
        let (value, _found) = resolve_value(arg, req);
        file_args.push(FileArg {
            env_name: arg.env_key(),
            data: value.into_bytes(),
        });
    }

    Ok(ExtractedCommand {
        argv,
        envv,
        file_args,
    })
}

fn validate_argument(value: &str, limits: &Limits) -> Result<(), CommandValidationError> {
    if value.len() > limits.max_arg_length {
        return Err(CommandValidationError::ArgumentTooLong {
            len: value.len(),
            max: limits.max_arg_length,
        });
    }
    if limits.strict_mode {
        if let Some(c) = value.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            return Err(CommandValidationError::DisallowedCharacter(c));
        }
    }
    Ok(())
}
