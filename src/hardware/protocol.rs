/**
 * Wire protocol for the tilt platform firmware.
 *
 * Newline-delimited ASCII, one command in flight at a time:
 * - Outgoing commands:
 *   "MOVE <steps>\n"   - Relative move in motor steps (signed)
 *   "HOME\n"           - Run the homing sequence
 *   "STATUS\n"         - Request a full status frame
 *   "TEMP\n" / "TILT\n" - Sensor readings, free-text line ending in a float
 * - Incoming status frame:
 *   "POS <int> ANGLE <float> SPEED <float> ACCEL <float> HOMED <YES|NO> E_STOP <YES|NO>"
 *
 * The firmware is not well-framed: boot banners may precede a frame and a
 * slow poll can return several concatenated frames in one read. Parsing
 * recovers by anchoring on the POS token.
 */

use thiserror::Error;

/// Degrees of platform tilt per motor step.
pub const DEG_PER_STEP: f64 = 0.0002;

pub fn degrees_to_steps(degrees: f64) -> i32 {
    (degrees / DEG_PER_STEP).round() as i32
}

/// A single firmware command. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Home,
    Move(i32),
    Status,
    Temp,
    Tilt,
    Calibrate,
    EmergencyStop,
    Stop,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Home => "HOME",
            Command::Move(_) => "MOVE",
            Command::Status => "STATUS",
            Command::Temp => "TEMP",
            Command::Tilt => "TILT",
            Command::Calibrate => "CALIBRATE",
            Command::EmergencyStop => "EMERGENCY_STOP",
            Command::Stop => "STOP",
        }
    }

    /// Wire form of the command, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Command::Move(steps) => format!("MOVE {}", steps),
            other => other.verb().to_string(),
        }
    }

    /// Lifecycle commands pass the run gate even when no test is active.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Command::Stop | Command::EmergencyStop)
    }
}

/// One parsed status frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub position: i32,
    pub angle: f64,
    pub speed: f64,
    pub acceleration: f64,
    pub homed: bool,
    pub emergency_stop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing POS field in status response")]
    MissingPosField,
    #[error("missing fields in status response: {0:?}")]
    MissingFields(Vec<&'static str>),
    #[error("no complete status frame in buffer")]
    MalformedDuplicate,
    #[error("no numeric value at end of response: {0:?}")]
    MissingValue(String),
}

const FRAME_FIELDS: [&str; 6] = ["POS", "ANGLE", "SPEED", "ACCEL", "HOMED", "E_STOP"];

/// Parse a status frame.
///
/// Anything before the first `POS` token is discarded; this recovers from
/// boot banners and garbled prefixes. The remainder is scanned as
/// whitespace-separated key/value pairs, so field order does not matter.
pub fn parse_status(line: &str) -> Result<StatusRecord, ParseError> {
    let start = line.find("POS").ok_or(ParseError::MissingPosField)?;
    let line = &line[start..];

    let parts: Vec<&str> = line.split_whitespace().collect();
    let mut position = None;
    let mut angle = None;
    let mut speed = None;
    let mut acceleration = None;
    let mut homed = None;
    let mut emergency_stop = None;

    for pair in parts.windows(2) {
        let value = pair[1];
        match pair[0] {
            "POS" => position = value.parse::<i32>().ok(),
            "ANGLE" => angle = value.parse::<f64>().ok(),
            "SPEED" => speed = value.parse::<f64>().ok(),
            "ACCEL" => acceleration = value.parse::<f64>().ok(),
            "HOMED" => homed = Some(value == "YES"),
            "E_STOP" => emergency_stop = Some(value == "YES"),
            _ => {}
        }
    }

    let mut missing = Vec::new();
    if position.is_none() {
        missing.push("position");
    }
    if angle.is_none() {
        missing.push("angle");
    }
    if speed.is_none() {
        missing.push("speed");
    }
    if acceleration.is_none() {
        missing.push("acceleration");
    }
    if homed.is_none() {
        missing.push("homed");
    }
    if emergency_stop.is_none() {
        missing.push("emergency_stop");
    }
    if !missing.is_empty() {
        return Err(ParseError::MissingFields(missing));
    }

    Ok(StatusRecord {
        position: position.unwrap(),
        angle: angle.unwrap(),
        speed: speed.unwrap(),
        acceleration: acceleration.unwrap(),
        homed: homed.unwrap(),
        emergency_stop: emergency_stop.unwrap(),
    })
}

/// Recover one frame from a buffer that may hold several concatenated ones.
///
/// The firmware can emit frames faster than they are consumed, so a read may
/// return "POS ...POS ...". Fragments are checked from the END backward and
/// the last complete frame wins: after repeated polling the most recent data
/// supersedes anything older. Older complete frames are dropped on purpose.
pub fn latest_complete_frame(raw: &str) -> Result<String, ParseError> {
    let fragments: Vec<&str> = raw.split("POS").collect();
    for fragment in fragments.into_iter().rev() {
        if fragment.trim().is_empty() {
            continue;
        }
        let candidate = format!("POS{}", fragment);
        if FRAME_FIELDS.iter().all(|field| candidate.contains(field)) {
            return Ok(candidate.trim().to_string());
        }
    }
    Err(ParseError::MalformedDuplicate)
}

/// Extract the trailing float of a free-text sensor line, e.g.
/// "Temperature: 23.51" or "TILT -1.20".
pub fn trailing_float(line: &str) -> Result<f64, ParseError> {
    line.split_whitespace()
        .last()
        .and_then(|token| token.parse::<f64>().ok())
        .ok_or_else(|| ParseError::MissingValue(line.to_string()))
}

/// Display class of a free-text line. Used only to pick a log severity for
/// operator output, never for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Error,
    Complete,
    Ready,
    Motion,
    Telemetry,
    Other,
}

pub fn classify_line(line: &str) -> LineClass {
    if line.contains("ERROR") {
        LineClass::Error
    } else if line.contains("complete") {
        LineClass::Complete
    } else if line.contains("READY") {
        LineClass::Ready
    } else if line.contains("Moving") {
        LineClass::Motion
    } else if line.contains("Temperature") || line.contains("Tilt") {
        LineClass::Telemetry
    } else {
        LineClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = "POS 1200 ANGLE 0.24 SPEED 400.0 ACCEL 800.0 HOMED YES E_STOP NO";

    #[test]
    fn test_encode_move_with_steps() {
        assert_eq!(Command::Move(520).encode(), "MOVE 520");
        assert_eq!(Command::Move(-200).encode(), "MOVE -200");
    }

    #[test]
    fn test_encode_bare_verbs() {
        assert_eq!(Command::Home.encode(), "HOME");
        assert_eq!(Command::Status.encode(), "STATUS");
        assert_eq!(Command::EmergencyStop.encode(), "EMERGENCY_STOP");
    }

    #[test]
    fn test_parse_well_formed_frame() {
        let record = parse_status(FRAME).unwrap();
        assert_eq!(record.position, 1200);
        assert_eq!(record.angle, 0.24);
        assert_eq!(record.speed, 400.0);
        assert_eq!(record.acceleration, 800.0);
        assert!(record.homed);
        assert!(!record.emergency_stop);
    }

    #[test]
    fn test_parse_recovers_from_leading_garbage() {
        let line = format!("\u{fffd}x7boot banner POS{}", &FRAME[3..]);
        let record = parse_status(&line).unwrap();
        assert_eq!(record.position, 1200);
        assert!(record.homed);
    }

    #[test]
    fn test_parse_accepts_reordered_fields() {
        let line = "POS 5 E_STOP NO HOMED YES ACCEL 1.0 SPEED 2.0 ANGLE -3.5";
        let record = parse_status(line).unwrap();
        assert_eq!(record.position, 5);
        assert_eq!(record.angle, -3.5);
        assert!(record.homed);
    }

    #[test]
    fn test_parse_missing_pos_field() {
        let result = parse_status("ANGLE 1.0 SPEED 2.0");
        assert_eq!(result, Err(ParseError::MissingPosField));
    }

    #[test]
    fn test_parse_reports_missing_fields() {
        let result = parse_status("POS 10 ANGLE 1.0 HOMED YES");
        match result {
            Err(ParseError::MissingFields(missing)) => {
                assert_eq!(missing, vec!["speed", "acceleration", "emergency_stop"]);
            }
            other => panic!("expected MissingFields, got {:?}", other),
        }
    }

    #[test]
    fn test_estop_yes_maps_to_true_anything_else_false() {
        let line = "POS 0 ANGLE 0 SPEED 0 ACCEL 0 HOMED MAYBE E_STOP YES";
        let record = parse_status(line).unwrap();
        assert!(!record.homed);
        assert!(record.emergency_stop);
    }

    // The duplicate scan keeps the LAST complete frame and silently discards
    // earlier ones: after repeated polling, later data supersedes earlier
    // data. This is the intended policy, not an accident.
    #[test]
    fn test_duplicate_buffer_prefers_later_frame() {
        let raw = "POS 100 ANGLE 1.0 SPEED 400.0 ACCEL 800.0 HOMED YES E_STOP NO\
                   POS 200 ANGLE 2.0 SPEED 400.0 ACCEL 800.0 HOMED YES E_STOP NO";
        let frame = latest_complete_frame(raw).unwrap();
        let record = parse_status(&frame).unwrap();
        assert_eq!(record.position, 200);
        assert_eq!(record.angle, 2.0);
    }

    #[test]
    fn test_duplicate_buffer_skips_incomplete_tail() {
        // Tail frame was cut mid-transmission; the older complete one wins.
        let raw = "POS 100 ANGLE 1.0 SPEED 400.0 ACCEL 800.0 HOMED YES E_STOP NO\
                   POS 200 ANGLE 2.0 SPE";
        let frame = latest_complete_frame(raw).unwrap();
        assert_eq!(parse_status(&frame).unwrap().position, 100);
    }

    #[test]
    fn test_duplicate_buffer_with_no_complete_frame() {
        assert_eq!(
            latest_complete_frame("POS 1 ANGLE 2.0 junk"),
            Err(ParseError::MalformedDuplicate)
        );
    }

    #[test]
    fn test_trailing_float_extraction() {
        assert_eq!(trailing_float("Temperature: 23.51").unwrap(), 23.51);
        assert_eq!(trailing_float("TILT -1.2").unwrap(), -1.2);
        assert!(trailing_float("no numbers here").is_err());
    }

    #[test]
    fn test_degrees_to_steps_conversion() {
        assert_eq!(degrees_to_steps(1.0), 5000);
        assert_eq!(degrees_to_steps(-0.5), -2500);
        assert_eq!(degrees_to_steps(0.0), 0);
    }

    #[test]
    fn test_line_classification_for_display() {
        assert_eq!(classify_line("ERROR: limit switch"), LineClass::Error);
        assert_eq!(classify_line("Homing complete"), LineClass::Complete);
        assert_eq!(classify_line("READY"), LineClass::Ready);
        assert_eq!(classify_line("Moving to target"), LineClass::Motion);
        assert_eq!(classify_line("Temperature: 23.5"), LineClass::Telemetry);
        assert_eq!(classify_line("hello"), LineClass::Other);
    }
}
