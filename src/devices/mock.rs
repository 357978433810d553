//! In-memory `LineLink` that replays canned meter replies.

use super::{LineLink, LinkError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedLink {
    responses: VecDeque<Vec<String>>,
    input: Arc<Mutex<VecDeque<String>>>,
    log: Arc<Mutex<Vec<String>>>,
    identity: Option<String>,
    flood: Option<String>,
    failing: bool,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines queued in reply to the next unanswered `:FETCh?`. An empty slice is a miss.
    pub fn respond(mut self, lines: &[&str]) -> Self {
        self.responses
            .push_back(lines.iter().map(|l| l.to_string()).collect());
        self
    }

    /// One reply per fetch, `None` meaning the meter stays silent.
    pub fn readings(mut self, values: &[Option<f64>]) -> Self {
        for value in values {
            let lines = value.map(|v| vec![v.to_string()]).unwrap_or_default();
            self.responses.push_back(lines);
        }
        self
    }

    pub fn identity(mut self, id: &str) -> Self {
        self.identity = Some(id.to_string());
        self
    }

    /// Never runs dry: hands back `line` whenever nothing else is queued.
    pub fn flood_with(mut self, line: &str) -> Self {
        self.flood = Some(line.to_string());
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Commands written so far, without terminators.
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    /// Bytes waiting to be read, one entry per line.
    pub fn input(&self) -> Arc<Mutex<VecDeque<String>>> {
        Arc::clone(&self.input)
    }
}

impl LineLink for ScriptedLink {
    fn clear_input(&mut self) -> Result<(), LinkError> {
        if self.failing {
            return Err(broken_pipe());
        }
        self.input.lock().unwrap().clear();
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.failing {
            return Err(broken_pipe());
        }
        let command = String::from_utf8_lossy(bytes).trim_end().to_string();
        let mut input = self.input.lock().unwrap();
        match command.as_str() {
            ":FETCh?" => {
                if let Some(lines) = self.responses.pop_front() {
                    input.extend(lines);
                }
            }
            "*IDN?" => input.extend(self.identity.clone()),
            _ => {}
        }
        self.log.lock().unwrap().push(command);
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, LinkError> {
        let next = self.input.lock().unwrap().pop_front();
        Ok(next.or_else(|| self.flood.clone()))
    }
}

fn broken_pipe() -> LinkError {
    LinkError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "link unplugged",
    ))
}
