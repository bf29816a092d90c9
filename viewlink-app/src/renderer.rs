//! Console stand-in for the 3D view: keeps camera state and prints it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use viewlink_engine::protocol::{Command, CommandKind, Parameters};
use viewlink_engine::Renderer;

const MIN_ZOOM: f64 = 0.1;
const MAX_ZOOM: f64 = 10.0;
const MAX_PITCH: f64 = 89.0;

/// Camera state.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    /// Degrees, normalized to (-180, 180].
    pub yaw: f64,
    /// Degrees, clamped to ±89.
    pub pitch: f64,
    pub zoom: f64,
    pub focus: Option<String>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            yaw: 0.0,
            pitch: 0.0,
            zoom: 1.0,
            focus: None,
        }
    }
}

fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

fn number(parameters: &Parameters, key: &str) -> Option<f64> {
    parameters.get(key).and_then(Value::as_f64)
}

impl ViewState {
    pub fn apply(&mut self, kind: &CommandKind, parameters: &Parameters) -> Result<(), String> {
        match kind {
            CommandKind::Rotate => self.rotate(parameters),
            CommandKind::Zoom => self.zoom(parameters),
            CommandKind::Focus => self.focus(parameters),
            CommandKind::Reset => {
                *self = ViewState::default();
                Ok(())
            }
            CommandKind::Other(action) => Err(format!("Unsupported action: {}", action)),
        }
    }

    fn rotate(&mut self, parameters: &Parameters) -> Result<(), String> {
        let angle = number(parameters, "angle").unwrap_or(0.0);
        let direction = parameters
            .get("direction")
            .or_else(|| parameters.get("axis"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        match direction {
            "left" => self.yaw = normalize_degrees(self.yaw - angle),
            "right" | "y" => self.yaw = normalize_degrees(self.yaw + angle),
            "up" | "x" => self.pitch = (self.pitch + angle).clamp(-MAX_PITCH, MAX_PITCH),
            "down" => self.pitch = (self.pitch - angle).clamp(-MAX_PITCH, MAX_PITCH),
            other => return Err(format!("Unknown rotate direction: {:?}", other)),
        }
        Ok(())
    }

    fn zoom(&mut self, parameters: &Parameters) -> Result<(), String> {
        if let Some(scale) = number(parameters, "scale") {
            if scale <= 0.0 {
                return Err(format!("Zoom scale must be positive, got {}", scale));
            }
            self.zoom = scale.clamp(MIN_ZOOM, MAX_ZOOM);
            return Ok(());
        }
        let distance = number(parameters, "distance").unwrap_or(0.5);
        let factor = 1.0 + distance.abs();
        match parameters.get("direction").and_then(Value::as_str) {
            Some("in") => self.zoom = (self.zoom * factor).clamp(MIN_ZOOM, MAX_ZOOM),
            Some("out") => self.zoom = (self.zoom / factor).clamp(MIN_ZOOM, MAX_ZOOM),
            _ => return Err("Zoom needs a scale or a direction".to_string()),
        }
        Ok(())
    }

    fn focus(&mut self, parameters: &Parameters) -> Result<(), String> {
        if let Some(target) = parameters.get("target").and_then(Value::as_str) {
            self.focus = Some(target.to_string());
            return Ok(());
        }
        let coords: Option<Vec<f64>> = parameters
            .get("position")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_f64).collect());
        match coords {
            Some(c) if c.len() == 3 => {
                self.focus = Some(format!("({}, {}, {})", c[0], c[1], c[2]));
                Ok(())
            }
            _ => Err("Focus needs a target or a position".to_string()),
        }
    }
}

/// Prints every applied command with the resulting view.
#[derive(Default)]
pub struct ConsoleRenderer {
    state: Mutex<ViewState>,
    quiet: bool,
}

impl ConsoleRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A renderer that keeps state without printing.
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    pub fn state(&self) -> ViewState {
        self.state.lock().clone()
    }
}

#[async_trait]
impl Renderer for ConsoleRenderer {
    async fn apply(&self, command: &Command) -> Result<(), String> {
        let view = {
            let mut state = self.state.lock();
            state.apply(&command.kind, &command.parameters)?;
            state.clone()
        };
        if !self.quiet {
            println!(
                "\n[{}] yaw {:.1}° pitch {:.1}° zoom {:.2}x focus {}",
                command.kind,
                view.yaw,
                view.pitch,
                view.zoom,
                view.focus.as_deref().unwrap_or("-")
            );
        }
        Ok(())
    }
}
