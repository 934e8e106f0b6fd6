//! Interactive run menu

use chatpilot_agent::RunParams;
use chatpilot_agent::transcript::validate_conversation_id;
use std::io::{self, BufRead, Write};

/// Result of reading one menu choice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    /// Start a run with the current parameters
    Start,
    /// Prompt for new parameters
    SetParameters,
    /// Exit the application
    Exit,
    /// Anything else
    Invalid,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Self {
        match input.trim() {
            "1" => MenuChoice::Start,
            "2" => MenuChoice::SetParameters,
            "3" | "q" | "quit" | "exit" => MenuChoice::Exit,
            _ => MenuChoice::Invalid,
        }
    }
}

pub fn print_menu(output: &mut impl Write) -> io::Result<()> {
    writeln!(output)?;
    writeln!(output, "1. Start run")?;
    writeln!(output, "2. Set parameters")?;
    writeln!(output, "3. Exit")?;
    write!(output, "Choose an action: ")?;
    output.flush()
}

/// Validate raw parameter answers
pub fn parse_params(
    iterations: &str,
    counterpart_id: &str,
    conversation_id: &str,
) -> Result<RunParams, String> {
    let iterations: u32 = iterations
        .trim()
        .parse()
        .map_err(|_| format!("Iterations must be a whole number, got {:?}", iterations.trim()))?;

    let counterpart_id = counterpart_id.trim();
    if counterpart_id.is_empty() {
        return Err("Character id must not be empty".to_string());
    }

    let conversation_id = conversation_id.trim();
    validate_conversation_id(conversation_id).map_err(|e| e.to_string())?;

    Ok(RunParams {
        iterations,
        conversation_id: conversation_id.to_string(),
        counterpart_id: counterpart_id.to_string(),
    })
}

fn prompt_line(
    input: &mut impl BufRead,
    output: &mut impl Write,
    prompt: &str,
) -> io::Result<Option<String>> {
    write!(output, "{}", prompt)?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Ask for run parameters until they are valid; `None` on end of input
pub fn prompt_parameters(
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> io::Result<Option<RunParams>> {
    loop {
        let Some(iterations) = prompt_line(input, output, "Enter the number of iterations: ")?
        else {
            return Ok(None);
        };
        let Some(counterpart) = prompt_line(input, output, "Character id: ")? else {
            return Ok(None);
        };
        let Some(conversation) = prompt_line(input, output, "Chat id: ")? else {
            return Ok(None);
        };

        match parse_params(&iterations, &counterpart, &conversation) {
            Ok(params) => return Ok(Some(params)),
            Err(message) => writeln!(output, "Incorrect data: {}", message)?,
        }
    }
}
