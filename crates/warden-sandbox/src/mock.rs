//! Mock runtime adapter for testing
//!
//! TigerStyle: In-memory simulation with deterministic behavior.
//!
//! Nothing is executed. Code requests are scanned for output calls
//! (`console.log`, `console.error`, `print`), exits and throws, with their
//! literal arguments evaluated against the request's environment and virtual
//! files. A busy-loop marker blocks until the timeout, like a real runaway
//! process would. Command requests run through registered handlers or a few
//! simulated builtins.

use crate::cancel::cancelled_or_pending;
use crate::config::RuntimeKind;
use crate::error::SandboxResult;
use crate::exec::{ExecOptions, ExecOutput, ExitStatus};
use crate::request::{CodeRequest, CommandRequest, ExecutionRequest};
use crate::traits::RuntimeAdapter;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use warden_core::constants::SANDBOX_WORKDIR;

/// Source fragments that never terminate
pub const BUSY_LOOP_MARKERS: [&str; 6] = [
    "while(true)",
    "while (true)",
    "while True:",
    "for(;;)",
    "for (;;)",
    "loop {}",
];

/// Handler for simulating command execution
pub type CommandHandler =
    Box<dyn Fn(&[String], &ExecOptions) -> SandboxResult<ExecOutput> + Send + Sync>;

/// Mock adapter for testing
///
/// Supports command handlers and a virtual filesystem for test scenarios.
pub struct MockAdapter {
    /// Command handlers for simulation
    handlers: RwLock<HashMap<String, CommandHandler>>,
    /// Files visible to every request
    files: RwLock<BTreeMap<String, String>>,
    executions: AtomicU64,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            files: RwLock::new(BTreeMap::new()),
            executions: AtomicU64::new(0),
        }
    }

    /// Register a command handler for simulation
    pub async fn register_handler(&self, command: impl Into<String>, handler: CommandHandler) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(command.into(), handler);
    }

    /// Builder form of [`Self::register_handler`]
    pub fn with_handler(mut self, command: impl Into<String>, handler: CommandHandler) -> Self {
        self.handlers.get_mut().insert(command.into(), handler);
        self
    }

    /// Add a file to the virtual filesystem
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.get_mut().insert(path.into(), content.into());
        self
    }

    /// Number of requests executed so far
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    async fn run_code(&self, code: &CodeRequest, options: &ExecOptions) -> ExecOutput {
        let start = Instant::now();
        if BUSY_LOOP_MARKERS.iter().any(|m| code.code.contains(m)) {
            return wait_out(options, None, start).await;
        }

        let mut files = self.files.read().await.clone();
        files.extend(code.files.iter().map(|(k, v)| (k.clone(), v.clone())));
        let scope = Scope {
            env: &code.env,
            files: &files,
        };
        let script = interpret(&code.code, &scope);
        finish(script.into_output(), options, start)
    }

    async fn run_command(
        &self,
        command: &CommandRequest,
        options: &ExecOptions,
    ) -> SandboxResult<ExecOutput> {
        let start = Instant::now();
        {
            let handlers = self.handlers.read().await;
            if let Some(handler) = handlers.get(&command.command) {
                return handler(command.args.as_slice(), options)
                    .map(|output| finish(output, options, start));
            }
        }

        let files = self.files.read().await;
        let expand = |arg: &String| expand_vars(arg, &command.env);
        let output = match command.command.as_str() {
            "echo" => {
                let words: Vec<String> = command.args.iter().map(expand).collect();
                ExecOutput::success(words.join(" "))
            }
            "cat" => match command.args.first() {
                None => ExecOutput::failure(1, "cat: missing operand"),
                Some(path) => match lookup(&files, path) {
                    Some(content) => ExecOutput::success(content.clone()),
                    None => ExecOutput::failure(
                        1,
                        format!("cat: {}: No such file or directory", path),
                    ),
                },
            },
            "env" => {
                let lines: Vec<String> = command
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                ExecOutput::success(lines.join("\n"))
            }
            "pwd" => {
                let cwd = match &command.cwd {
                    Some(cwd) => format!("{}/{}", SANDBOX_WORKDIR, cwd),
                    None => SANDBOX_WORKDIR.to_string(),
                };
                ExecOutput::success(cwd)
            }
            "true" => ExecOutput::success(""),
            "false" => ExecOutput::failure(1, ""),
            "sleep" => {
                let seconds = command
                    .args
                    .first()
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .unwrap_or(0.0);
                let requested = Duration::from_secs_f64(seconds);
                return Ok(wait_out(options, Some(requested), start).await);
            }
            other => ExecOutput::failure(127, format!("{}: command not found", other)),
        };
        Ok(finish(output, options, start))
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeAdapter for MockAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Mock
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        options: &ExecOptions,
    ) -> SandboxResult<ExecOutput> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if options.is_cancelled() {
            return Ok(ExecOutput::cancelled(0));
        }
        match request {
            ExecutionRequest::Code(code) => Ok(self.run_code(code, options).await),
            ExecutionRequest::Command(command) => self.run_command(command, options).await,
        }
    }
}

/// Sleep for `requested` (forever when `None`), bounded by timeout and cancel
async fn wait_out(options: &ExecOptions, requested: Option<Duration>, start: Instant) -> ExecOutput {
    let timeout = options.timeout();
    let limit = requested.map_or(timeout, |r| r.min(timeout));
    let completes = requested.is_some_and(|r| r < timeout);

    tokio::select! {
        _ = tokio::time::sleep(limit) => {
            let elapsed = start.elapsed().as_millis() as u64;
            if completes {
                ExecOutput::success("").with_duration(elapsed)
            } else {
                ExecOutput::timed_out(elapsed)
            }
        }
        _ = cancelled_or_pending(options.cancel.as_ref()) => {
            ExecOutput::cancelled(start.elapsed().as_millis() as u64)
        }
    }
}

/// Apply the output cap and stamp the duration
fn finish(mut output: ExecOutput, options: &ExecOptions, start: Instant) -> ExecOutput {
    let cap = usize::try_from(options.max_output_bytes).unwrap_or(usize::MAX);
    if output.stdout.len() > cap {
        output.stdout = output.stdout.slice(..cap);
        output.stdout_truncated = true;
    }
    if output.stderr.len() > cap {
        output.stderr = output.stderr.slice(..cap);
        output.stderr_truncated = true;
    }
    output.with_duration(start.elapsed().as_millis() as u64)
}

// =============================================================================
// Code interpretation
// =============================================================================

struct Scope<'a> {
    env: &'a BTreeMap<String, String>,
    files: &'a BTreeMap<String, String>,
}

#[derive(Default)]
struct Script {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit_code: i32,
}

impl Script {
    fn fail(&mut self, message: String) {
        self.stderr.push(message);
        self.exit_code = 1;
    }

    fn into_output(self) -> ExecOutput {
        ExecOutput::exited(ExitStatus::exited(self.exit_code))
            .with_stdout(self.stdout.join("\n"))
            .with_stderr(self.stderr.join("\n"))
    }
}

#[derive(Clone, Copy)]
enum Action {
    Stdout,
    Stderr,
    Exit,
    Throw,
}

const STATEMENTS: [(&str, Action); 9] = [
    ("console.log(", Action::Stdout),
    ("console.info(", Action::Stdout),
    ("console.error(", Action::Stderr),
    ("console.warn(", Action::Stderr),
    ("print(", Action::Stdout),
    ("process.exit(", Action::Exit),
    ("sys.exit(", Action::Exit),
    ("throw ", Action::Throw),
    ("raise ", Action::Throw),
];

fn interpret(code: &str, scope: &Scope<'_>) -> Script {
    let mut script = Script::default();
    let mut pos = 0;

    while let Some((at, marker, action)) = next_statement(code, pos) {
        let body_start = at + marker.len();
        match action {
            Action::Stdout | Action::Stderr | Action::Exit => {
                let Some(close) = closing_paren(code, body_start) else {
                    script.fail(format!("SyntaxError: unterminated call to {}", marker));
                    break;
                };
                let args = &code[body_start..close];
                pos = close + 1;

                match action {
                    Action::Exit => {
                        exit_with(&mut script, args, scope);
                        break;
                    }
                    _ => match eval_args(args, scope) {
                        Ok(line) if matches!(action, Action::Stdout) => script.stdout.push(line),
                        Ok(line) => script.stderr.push(line),
                        Err(message) => {
                            script.fail(message);
                            break;
                        }
                    },
                }
            }
            Action::Throw => {
                let end = code[body_start..]
                    .find(|c: char| c == '\n' || c == ';')
                    .map_or(code.len(), |i| body_start + i);
                let message = thrown_message(&code[body_start..end], scope);
                script.fail(message);
                break;
            }
        }
    }
    script
}

/// Earliest statement marker at or after `from`
fn next_statement(code: &str, from: usize) -> Option<(usize, &'static str, Action)> {
    STATEMENTS
        .iter()
        .filter_map(|&(marker, action)| find_word(code, marker, from).map(|at| (at, marker, action)))
        .min_by_key(|(at, _, _)| *at)
}

/// Find `marker` not preceded by an identifier character
fn find_word(code: &str, marker: &str, from: usize) -> Option<usize> {
    let mut search = from;
    while let Some(offset) = code[search..].find(marker) {
        let at = search + offset;
        let preceded = code[..at]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if !preceded {
            return Some(at);
        }
        search = at + marker.len();
    }
    None
}

fn exit_with(script: &mut Script, args: &str, scope: &Scope<'_>) {
    let args = args.trim();
    if args.is_empty() {
        return;
    }
    match eval(args, scope) {
        Ok(value) => match value.trim().parse::<i32>() {
            Ok(code) => script.exit_code = code,
            // sys.exit("message") prints the message and exits 1
            Err(_) => script.fail(value),
        },
        Err(message) => script.fail(message),
    }
}

/// `new Error('x')` -> `Error: x`, `ValueError("x")` -> `ValueError: x`
fn thrown_message(expr: &str, scope: &Scope<'_>) -> String {
    let expr = expr.trim();
    let expr = expr.strip_prefix("new ").unwrap_or(expr).trim();
    if expr.is_empty() {
        return "Error".to_string();
    }

    if let Some(open) = expr.find('(') {
        let name = expr[..open].trim();
        let is_ident = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        if is_ident {
            let message = closing_paren(expr, open + 1)
                .map(|close| eval_args(&expr[open + 1..close], scope).unwrap_or_else(|e| e))
                .unwrap_or_default();
            return if message.is_empty() {
                name.to_string()
            } else {
                format!("{}: {}", name, message)
            };
        }
    }
    eval(expr, scope).unwrap_or_else(|e| e)
}

/// Evaluate call arguments, joined by a space like `console.log`/`print`
fn eval_args(args: &str, scope: &Scope<'_>) -> Result<String, String> {
    let values = split_top_level(args, ',')
        .into_iter()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| eval(a, scope))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(values.join(" "))
}

fn eval(expr: &str, scope: &Scope<'_>) -> Result<String, String> {
    let expr = expr.trim();

    let parts = split_top_level(expr, '+');
    if parts.len() > 1 && parts.iter().any(|p| is_quoted(p.trim())) {
        return parts.into_iter().map(|p| eval(p, scope)).collect();
    }

    if let Some(text) = string_literal(expr, scope)? {
        return Ok(text);
    }

    if let Some(name) = expr.strip_prefix("process.env.") {
        return Ok(env_or(scope, name, "undefined"));
    }
    for (prefix, missing) in [
        ("process.env[", "undefined"),
        ("os.environ[", "None"),
        ("os.environ.get(", "None"),
        ("os.getenv(", "None"),
    ] {
        if let Some(rest) = expr.strip_prefix(prefix) {
            let key = rest.get(..rest.len().saturating_sub(1)).unwrap_or_default();
            let key = split_top_level(key, ',').first().copied().unwrap_or_default();
            let key = eval(key, scope)?;
            return Ok(env_or(scope, &key, missing));
        }
    }

    for prefix in ["fs.readFileSync(", "open("] {
        if let Some(rest) = expr.strip_prefix(prefix) {
            let Some(close) = closing_paren(rest, 0) else {
                break;
            };
            let path_arg = split_top_level(&rest[..close], ',')
                .first()
                .copied()
                .unwrap_or_default();
            let path = eval(path_arg, scope)?;
            return read_file(scope, &path, prefix);
        }
    }

    Ok(expr.to_string())
}

fn env_or(scope: &Scope<'_>, key: &str, missing: &str) -> String {
    scope
        .env
        .get(key)
        .cloned()
        .unwrap_or_else(|| missing.to_string())
}

fn read_file(scope: &Scope<'_>, path: &str, via: &str) -> Result<String, String> {
    match lookup(scope.files, path) {
        Some(content) => Ok(content.clone()),
        None if via == "open(" => Err(format!(
            "FileNotFoundError: [Errno 2] No such file or directory: '{}'",
            path
        )),
        None => Err(format!(
            "Error: ENOENT: no such file or directory, open '{}'",
            path
        )),
    }
}

/// Resolve a path the way the request would see it
fn lookup<'a>(files: &'a BTreeMap<String, String>, path: &str) -> Option<&'a String> {
    let workdir_prefix = format!("{}/", SANDBOX_WORKDIR);
    let relative = path
        .strip_prefix(workdir_prefix.as_str())
        .unwrap_or(path)
        .trim_start_matches("./");
    files.get(relative)
}

/// Expand `$VAR` and `${VAR}`; unknown variables expand to nothing
fn expand_vars(text: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        if name.is_empty() {
            out.push('$');
        } else if let Some(value) = env.get(name) {
            out.push_str(value);
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

// =============================================================================
// Lexing helpers
// =============================================================================

fn is_quote(c: char) -> bool {
    matches!(c, '\'' | '"' | '`')
}

fn is_quoted(expr: &str) -> bool {
    let mut chars = expr.chars();
    match chars.next() {
        Some('f') => chars.next().is_some_and(is_quote),
        Some(c) => is_quote(c),
        None => false,
    }
}

/// Index of the `)` that closes a call whose arguments start at `from`
fn closing_paren(src: &str, from: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in src[from..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            c if is_quote(c) => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' if depth == 0 => return Some(from + i),
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

/// Split on `sep` outside quotes and brackets
fn split_top_level(src: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in src.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            c if is_quote(c) => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&src[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&src[start..]);
    parts
}

/// Evaluate `expr` if it is exactly one string literal
///
/// Template literals substitute `${...}`, Python f-strings `{...}`.
fn string_literal(expr: &str, scope: &Scope<'_>) -> Result<Option<String>, String> {
    let (formatted, body) = match expr.strip_prefix('f') {
        Some(rest) if rest.starts_with(is_quote) => (true, rest),
        _ => (false, expr),
    };
    let Some(quote) = body.chars().next().filter(|c| is_quote(*c)) else {
        return Ok(None);
    };

    let mut text = String::new();
    let mut escaped = false;
    let mut end = None;
    for (i, c) in body.char_indices().skip(1) {
        if escaped {
            text.push(match c {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            end = Some(i);
            break;
        } else {
            text.push(c);
        }
    }
    // A literal followed by more source is not a single literal.
    if end != Some(body.len() - quote.len_utf8()) {
        return Ok(None);
    }

    let text = match (quote, formatted) {
        ('`', _) => interpolate(&text, "${", scope)?,
        (_, true) => interpolate(&text, "{", scope)?,
        _ => text,
    };
    Ok(Some(text))
}

fn interpolate(template: &str, open: &str, scope: &Scope<'_>) -> Result<String, String> {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        let inner_start = start + open.len();
        let Some(len) = rest[inner_start..].find('}') else {
            rest = &rest[start..];
            break;
        };
        out.push_str(&eval(&rest[inner_start..inner_start + len], scope)?);
        rest = &rest[inner_start + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
