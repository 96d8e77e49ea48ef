//! Terminal plumbing shared by `chat` and `rag`: reading stdin, printing
//! stream events and asking for approval decisions.

use std::io::Write;

use agentgate_agent::{AgentRunner, ChatRequest, RunFlags, StreamEvent};
use agentgate_core::interrupt::{Decision, DecisionKind, Interrupt};
use agentgate_core::tool::ToolCall;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

pub type Input = Lines<BufReader<Stdin>>;

pub fn stdin_lines() -> Input {
    BufReader::new(tokio::io::stdin()).lines()
}

pub fn new_session_id() -> String {
    format!("cli-{}", uuid::Uuid::new_v4())
}

/// Print `label` and read one line. `None` on end of input.
pub async fn prompt(input: &mut Input, label: &str) -> std::io::Result<Option<String>> {
    print!("{label}");
    std::io::stdout().flush()?;
    input.next_line().await
}

/// Run one user turn, asking for decisions and resuming until the session
/// finishes or fails.
pub async fn run_turn(
    runner: &AgentRunner,
    session_id: &str,
    query: String,
    flags: RunFlags,
    input: &mut Input,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = ChatRequest::query(session_id, query).with_flags(flags);
    loop {
        let mut rx = runner.run_stream(request).await?;
        let mut pending = None;
        {
            let mut out = std::io::stdout();
            while let Some(event) = rx.recv().await {
                render(&event, &mut out)?;
                out.flush()?;
                if let StreamEvent::Interrupted { interrupt } = event {
                    pending = Some(interrupt);
                }
            }
        }

        let Some(interrupt) = pending else {
            return Ok(());
        };
        let decisions = ask_decisions(&interrupt, input).await?;
        request = ChatRequest::resume(session_id, decisions).with_flags(flags);
    }
}

/// Write one event in human-readable form.
pub fn render(event: &StreamEvent, out: &mut impl Write) -> std::io::Result<()> {
    match event {
        StreamEvent::Token { text, .. } => write!(out, "{text}"),
        StreamEvent::ToolCallsAnnounced { calls, .. } => {
            for call in calls {
                writeln!(out, "\n  [tool call] {}", describe(call))?;
            }
            Ok(())
        }
        StreamEvent::ToolOutput { results } => {
            for result in results {
                writeln!(out, "  [tool output] {}: {}", result.name, result.content)?;
            }
            Ok(())
        }
        StreamEvent::Interrupted { interrupt } => writeln!(
            out,
            "\n  Approval needed for {} tool call(s).",
            interrupt.pending_tool_calls.len()
        ),
        StreamEvent::Done { .. } => writeln!(out),
        StreamEvent::Error { message } => writeln!(out, "\n  [error] {message}"),
    }
}

fn describe(call: &ToolCall) -> String {
    format!("{}({})", call.name, call.arguments_json())
}

/// Parse a decision keyword, accepting the first letter as shorthand.
///
/// An empty `allowed` list permits every kind.
pub fn parse_kind(line: &str, allowed: &[DecisionKind]) -> Result<DecisionKind, String> {
    let kind = match line.trim().to_ascii_lowercase().as_str() {
        "a" | "approve" | "y" | "yes" => DecisionKind::Approve,
        "r" | "reject" | "n" | "no" => DecisionKind::Reject,
        "e" | "edit" => DecisionKind::Edit,
        other => return Err(format!("unknown answer '{other}'")),
    };
    if !allowed.is_empty() && !allowed.contains(&kind) {
        return Err(format!("'{}' is not allowed here", kind.as_str()));
    }
    Ok(kind)
}

/// Parse edited arguments; they must form a JSON object.
pub fn parse_arguments(line: &str) -> Result<serde_json::Value, String> {
    match serde_json::from_str::<serde_json::Value>(line.trim()) {
        Ok(value @ serde_json::Value::Object(_)) => Ok(value),
        Ok(_) => Err("arguments must be a JSON object".into()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

async fn ask_decisions(
    interrupt: &Interrupt,
    input: &mut Input,
) -> Result<Vec<Decision>, Box<dyn std::error::Error>> {
    let mut decisions = Vec::with_capacity(interrupt.pending_tool_calls.len());
    for (i, call) in interrupt.pending_tool_calls.iter().enumerate() {
        let allowed = interrupt.allowed_decisions.get(i).cloned().unwrap_or_default();
        let choices = if allowed.is_empty() {
            DecisionKind::all()
        } else {
            allowed.clone()
        };
        let choices: Vec<&str> = choices.iter().map(|k| k.as_str()).collect();

        println!("  {}", describe(call));
        let kind = loop {
            let label = format!("  {} > ", choices.join("/"));
            let line = prompt(input, &label).await?.ok_or("stdin closed while awaiting approval")?;
            match parse_kind(&line, &allowed) {
                Ok(kind) => break kind,
                Err(e) => println!("  {e}"),
            }
        };

        let decision = match kind {
            DecisionKind::Approve => Decision::approve(),
            DecisionKind::Reject => {
                let reason = prompt(input, "  Reason (optional) > ").await?.unwrap_or_default();
                let reason = reason.trim();
                Decision::reject((!reason.is_empty()).then(|| reason.to_string()))
            }
            DecisionKind::Edit => loop {
                let line = prompt(input, "  New arguments (JSON) > ")
                    .await?
                    .ok_or("stdin closed while awaiting approval")?;
                match parse_arguments(&line) {
                    Ok(arguments) => break Decision::edit(&call.name, arguments),
                    Err(e) => println!("  {e}"),
                }
            },
        };
        decisions.push(decision);
    }
    Ok(decisions)
}
