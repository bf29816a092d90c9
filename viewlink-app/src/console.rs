//! Line-oriented console: turns typed lines into engine submissions.

use serde_json::{json, Map, Value};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use viewlink_engine::protocol::{CommandKind, CommandOrigin, Parameters};
use viewlink_engine::{CommandEngine, SubmitOutcome};

const DEFAULT_ROTATE_ANGLE: f64 = 15.0;
const DEFAULT_ZOOM_DISTANCE: f64 = 0.5;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Submit {
        kind: CommandKind,
        parameters: Parameters,
    },
    Status,
    Reconnect,
    Disconnect,
    Help,
    Quit,
    Empty,
}

fn submit(kind: CommandKind, parameters: Value) -> ConsoleInput {
    ConsoleInput::Submit {
        kind,
        parameters: match parameters {
            Value::Object(map) => map,
            _ => Map::new(),
        },
    }
}

fn number(word: &str, what: &str) -> Result<f64, String> {
    word.parse::<f64>()
        .map_err(|_| format!("Invalid {}: {}", what, word))
}

fn scalar(word: &str) -> Value {
    if let Ok(n) = word.parse::<f64>() {
        return json!(n);
    }
    match word {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(word.to_string()),
    }
}

/// Parse a console line.
///
/// # Errors
/// Returns a message suitable for printing when the line is malformed.
pub fn parse_line(line: &str) -> Result<ConsoleInput, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ConsoleInput::Empty);
    }
    if line.starts_with('{') {
        return parse_json(line);
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    let verb = words[0].to_ascii_lowercase();
    let args = &words[1..];

    match verb.as_str() {
        "status" => Ok(ConsoleInput::Status),
        "reconnect" => Ok(ConsoleInput::Reconnect),
        "disconnect" => Ok(ConsoleInput::Disconnect),
        "help" | "?" => Ok(ConsoleInput::Help),
        "quit" | "exit" => Ok(ConsoleInput::Quit),
        "rotate" => parse_rotate(args),
        "zoom" => parse_zoom(args),
        "focus" => parse_focus(args),
        "reset" => Ok(submit(CommandKind::Reset, json!({}))),
        _ => parse_generic(&verb, args),
    }
}

fn parse_json(line: &str) -> Result<ConsoleInput, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("Invalid JSON: {}", e))?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| "JSON command needs an \"action\" string".to_string())?;
    let parameters = value.get("parameters").cloned().unwrap_or_else(|| json!({}));
    if !parameters.is_object() {
        return Err("\"parameters\" must be an object".to_string());
    }
    Ok(submit(CommandKind::parse(action), parameters))
}

fn parse_rotate(args: &[&str]) -> Result<ConsoleInput, String> {
    let direction = match args.first() {
        Some(d) if matches!(*d, "left" | "right" | "up" | "down") => *d,
        Some(d) => return Err(format!("Unknown rotate direction: {}", d)),
        None => return Err("Usage: rotate <left|right|up|down> [degrees]".to_string()),
    };
    let angle = match args.get(1) {
        Some(a) => number(a, "angle")?,
        None => DEFAULT_ROTATE_ANGLE,
    };
    Ok(submit(
        CommandKind::Rotate,
        json!({"direction": direction, "angle": angle}),
    ))
}

fn parse_zoom(args: &[&str]) -> Result<ConsoleInput, String> {
    match args {
        ["scale", value] => Ok(submit(
            CommandKind::Zoom,
            json!({"scale": number(value, "scale")?}),
        )),
        [direction @ ("in" | "out")] => Ok(submit(
            CommandKind::Zoom,
            json!({"direction": direction, "distance": DEFAULT_ZOOM_DISTANCE}),
        )),
        [direction @ ("in" | "out"), distance] => Ok(submit(
            CommandKind::Zoom,
            json!({"direction": direction, "distance": number(distance, "distance")?}),
        )),
        _ => Err("Usage: zoom <in|out> [distance] | zoom scale <factor>".to_string()),
    }
}

fn parse_focus(args: &[&str]) -> Result<ConsoleInput, String> {
    match args {
        [] => Err("Usage: focus <object> | focus <x> <y> <z>".to_string()),
        [x, y, z] if x.parse::<f64>().is_ok() => Ok(submit(
            CommandKind::Focus,
            json!({"position": [number(x, "x")?, number(y, "y")?, number(z, "z")?]}),
        )),
        words => Ok(submit(
            CommandKind::Focus,
            json!({"target": words.join(" ")}),
        )),
    }
}

/// `<action> key=value ...` for kinds without a dedicated syntax.
fn parse_generic(action: &str, args: &[&str]) -> Result<ConsoleInput, String> {
    let mut parameters = Map::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Unknown command: {} (try 'help')", action))?;
        parameters.insert(key.to_string(), scalar(value));
    }
    Ok(ConsoleInput::Submit {
        kind: CommandKind::parse(action),
        parameters,
    })
}

fn print_help() {
    println!("\nCommands:");
    println!("  rotate <left|right|up|down> [degrees]");
    println!("  zoom <in|out> [distance]   zoom scale <factor>");
    println!("  focus <object>             focus <x> <y> <z>");
    println!("  reset");
    println!("  <action> key=value ...     or a JSON {{\"action\": .., \"parameters\": {{..}}}}");
    println!("  status, reconnect, disconnect, help, quit\n");
}

fn print_status(engine: &CommandEngine) {
    println!("\nConnection: {} ({})", engine.status(), engine.connection().endpoint());
    if let Some(client_id) = engine.client_id() {
        println!("Client id: {}", client_id);
    }
    if let Some(err) = engine.connection().last_error() {
        println!("Last error: {}", err);
    }
    println!("Queued: {}", engine.queued().len());
    println!("Awaiting responses: {}\n", engine.pending_responses());
}

fn describe(outcome: &SubmitOutcome) -> String {
    use viewlink_engine::EnqueueOutcome;
    match outcome {
        SubmitOutcome::Duplicate => "skipped: same as a command that just ran".to_string(),
        SubmitOutcome::Queued(EnqueueOutcome::Enqueued(id)) => format!("queued {}", id),
        SubmitOutcome::Queued(EnqueueOutcome::Replaced { id, superseded }) => {
            format!("queued {} (replaces {})", id, superseded)
        }
        SubmitOutcome::Queued(EnqueueOutcome::DroppedSimilar { existing }) => {
            format!("skipped: similar to queued {}", existing)
        }
    }
}

/// Read lines from stdin until `quit` or end of input.
pub async fn run(engine: Arc<CommandEngine>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();

    loop {
        print!("viewlink> ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_line(&line) {
            Ok(ConsoleInput::Empty) => {}
            Ok(ConsoleInput::Quit) => break,
            Ok(ConsoleInput::Help) => print_help(),
            Ok(ConsoleInput::Status) => print_status(&engine),
            Ok(ConsoleInput::Disconnect) => engine.disconnect(),
            Ok(ConsoleInput::Reconnect) => {
                if let Err(e) = engine.reconnect().await {
                    println!("Reconnect failed: {}", e);
                }
            }
            Ok(ConsoleInput::Submit { kind, parameters }) => {
                let outcome = engine.submit(kind, parameters, CommandOrigin::Ui);
                println!("{}", describe(&outcome));
            }
            Err(message) => println!("{}", message),
        }
    }
    Ok(())
}
