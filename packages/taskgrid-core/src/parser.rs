/// Command-file Parser (component I): a pure function from file bytes to
/// typed task blocks. No I/O, no shell involvement beyond leaving command
/// strings untouched — they are passed verbatim to a shell later.
use crate::error::ParseError;
use crate::model::{Mode, QueueId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTask {
    pub queue_id: QueueId,
    pub gpu_count: Option<u32>,
    pub memory_gb: u64,
    pub commands: Vec<String>,
}

/// Split the file into blocks: runs of non-comment, non-blank lines,
/// separated by one or more blank lines. `#`-prefixed lines are dropped
/// entirely — they neither start a block nor count as a separator.
fn split_blocks(input: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            continue;
        }
        if trimmed.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Parse the leading integer token off a line, ignoring anything from a
/// `#` onward and anything after the first whitespace-separated token.
fn parse_leading_int(block: usize, line_no: usize, line: &str) -> Result<i64, ParseError> {
    let before_comment = line.split('#').next().unwrap_or("");
    let token = before_comment.split_whitespace().next().unwrap_or("");
    token
        .parse::<i64>()
        .map_err(|_| ParseError::NonIntegerWhereExpected {
            block,
            line: line_no,
            found: line.to_string(),
        })
}

fn parse_block(block_idx: usize, lines: &[&str], mode: Mode) -> Result<ParsedTask, ParseError> {
    let min_len = match mode {
        Mode::Single => 3, // queue_id, >=1 command, memory_gb
        Mode::Multi => 4,  // queue_id, >=1 command, gpu_count, memory_gb
    };
    if lines.len() < min_len {
        return Err(ParseError::MalformedBlock {
            block: block_idx,
            reason: format!("expected at least {min_len} lines, found {}", lines.len()),
        });
    }

    let queue_id_raw = parse_leading_int(block_idx, 0, lines[0])?;
    let queue_id: QueueId = queue_id_raw.try_into().map_err(|_| ParseError::MalformedBlock {
        block: block_idx,
        reason: format!("queue id {queue_id_raw} is not a valid non-negative id"),
    })?;

    let (command_lines, gpu_count, memory_gb_line_idx) = match mode {
        Mode::Single => (&lines[1..lines.len() - 1], None, lines.len() - 1),
        Mode::Multi => {
            let gpu_count_idx = lines.len() - 2;
            let gpu_count_raw = parse_leading_int(block_idx, gpu_count_idx, lines[gpu_count_idx])?;
            let gpu_count: u32 = gpu_count_raw.try_into().map_err(|_| ParseError::MalformedBlock {
                block: block_idx,
                reason: format!("gpu_count {gpu_count_raw} must be a positive integer"),
            })?;
            if gpu_count == 0 {
                return Err(ParseError::MalformedBlock {
                    block: block_idx,
                    reason: "gpu_count must be >= 1".to_string(),
                });
            }
            (&lines[1..gpu_count_idx], Some(gpu_count), lines.len() - 1)
        }
    };

    if command_lines.is_empty() {
        return Err(ParseError::MissingRequiredField {
            block: block_idx,
            field: "commands",
        });
    }

    let memory_gb_raw = parse_leading_int(block_idx, memory_gb_line_idx, lines[memory_gb_line_idx])?;
    let memory_gb: u64 = memory_gb_raw.try_into().map_err(|_| ParseError::MalformedBlock {
        block: block_idx,
        reason: format!("memory_gb {memory_gb_raw} must be non-negative"),
    })?;

    let commands = command_lines.iter().map(|l| l.to_string()).collect();

    Ok(ParsedTask {
        queue_id,
        gpu_count,
        memory_gb,
        commands,
    })
}

/// Parse an entire command file for the given execution mode.
pub fn parse(input: &str, mode: Mode) -> Result<Vec<ParsedTask>, ParseError> {
    split_blocks(input)
        .into_iter()
        .enumerate()
        .map(|(idx, lines)| parse_block(idx, &lines, mode))
        .collect()
}
