//! UCI engine subprocess driver.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

use crossbeam_channel::{self as chan, Receiver, RecvTimeoutError};

use crate::board::BoardState;
use crate::config::EngineConfig;
use crate::error::EngineError;

pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);
pub const ENGINE_QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one bounded search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub bestmove: String,
    pub elapsed_ms: u64,
    pub info: InfoSnapshot,
}

/// Last multipv=1 `info` line fields seen during a search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoSnapshot {
    pub depth: Option<u32>,
    pub score_cp: Option<i32>,
    pub score_mate: Option<i32>,
    pub nodes: Option<u64>,
}

impl InfoSnapshot {
    pub fn update_from_line(&mut self, line: &str) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first().copied() != Some("info") {
            return;
        }
        if let Some(pos) = tokens.iter().position(|t| *t == "multipv")
            && tokens.get(pos + 1).and_then(|v| v.parse::<u32>().ok()) != Some(1)
        {
            return;
        }
        let mut i = 1;
        while i < tokens.len() {
            match tokens[i] {
                "depth" => {
                    self.depth = tokens.get(i + 1).and_then(|v| v.parse().ok());
                    i += 1;
                }
                "nodes" => {
                    self.nodes = tokens.get(i + 1).and_then(|v| v.parse().ok());
                    i += 1;
                }
                "score" => match tokens.get(i + 1).copied() {
                    Some("cp") => {
                        self.score_cp = tokens.get(i + 2).and_then(|v| v.parse().ok());
                        self.score_mate = None;
                        i += 2;
                    }
                    Some("mate") => {
                        self.score_mate = tokens.get(i + 2).and_then(|v| v.parse().ok());
                        self.score_cp = None;
                        i += 2;
                    }
                    _ => {}
                },
                // pv runs to the end of the line.
                "pv" => break,
                _ => {}
            }
            i += 1;
        }
    }

    pub fn describe(&self) -> String {
        let depth = self.depth.map_or("-".to_string(), |d| d.to_string());
        let score = match (self.score_cp, self.score_mate) {
            (_, Some(m)) => format!("mate {m}"),
            (Some(cp), None) => format!("cp {cp}"),
            (None, None) => "-".to_string(),
        };
        format!("depth {depth} score {score}")
    }
}

/// A search engine the pool can lend out.
pub trait SearchEngine: Send {
    fn label(&self) -> &str;

    /// Searches the board's position for at most `think` and returns the best move.
    fn search(&mut self, board: &BoardState, think: Duration) -> Result<SearchOutcome, EngineError>;

    /// False once the engine failed in a way that makes further use pointless.
    fn is_healthy(&self) -> bool;
}

/// Builds engine `index` of the pool; also used to replace broken engines.
pub type EngineFactory =
    Box<dyn Fn(usize) -> Result<Box<dyn SearchEngine>, EngineError> + Send + Sync>;

/// Factory spawning [`UciEngine`] processes from the engine configuration.
pub fn uci_factory(cfg: EngineConfig) -> EngineFactory {
    Box::new(move |index| {
        let engine = UciEngine::spawn(&cfg, format!("engine#{index}"))?;
        Ok(Box::new(engine) as Box<dyn SearchEngine>)
    })
}

/// 1本の UCI エンジンに対する入出力をカプセル化する。
pub struct UciEngine {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    rx: Receiver<String>,
    opt_names: HashSet<String>,
    ready_timeout: Duration,
    search_margin: Duration,
    healthy: bool,
    label: String,
}

impl UciEngine {
    pub fn spawn(cfg: &EngineConfig, label: String) -> Result<Self, EngineError> {
        let mut cmd = Command::new(&cfg.path);
        cmd.args(&cfg.args).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::null());
        // Own process group: terminal Ctrl-C must reach only the bot.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let spawn_err = |source| EngineError::Spawn {
            path: cfg.path.display().to_string(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_err)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("no stdout")))?;

        let (tx, rx) = chan::unbounded::<String>();
        std::thread::Builder::new()
            .name(format!("{label}-stdout"))
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(l) => {
                            if tx.send(l).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .map_err(spawn_err)?;

        let mut engine = Self {
            child,
            stdin: BufWriter::new(stdin),
            rx,
            opt_names: HashSet::new(),
            ready_timeout: cfg.ready_timeout(),
            search_margin: cfg.search_margin(),
            healthy: true,
            label,
        };
        engine.initialize(cfg)?;
        Ok(engine)
    }

    fn initialize(&mut self, cfg: &EngineConfig) -> Result<(), EngineError> {
        self.write_line("uci")?;
        loop {
            let line = self.recv_line(self.ready_timeout)?;
            if let Some(rest) = line.strip_prefix("option ") {
                if let Some(name) = parse_option_name(rest) {
                    self.opt_names.insert(name);
                }
            } else if line.trim() == "uciok" {
                break;
            }
        }
        for (name, value) in cfg.option_pairs() {
            if !self.set_option_if_available(&name, &value)? {
                log::warn!("{}: engine does not advertise option {name}, skipped", self.label);
            }
        }
        self.sync_ready()?;
        self.write_line("ucinewgame")?;
        log::debug!("{}: ready ({} options advertised)", self.label, self.opt_names.len());
        Ok(())
    }

    pub fn sync_ready(&mut self) -> Result<(), EngineError> {
        self.write_line("isready")?;
        loop {
            if self.recv_line(self.ready_timeout)?.trim() == "readyok" {
                return Ok(());
            }
        }
    }

    /// Returns whether the option was sent.
    pub fn set_option_if_available(&mut self, name: &str, value: &str) -> Result<bool, EngineError> {
        if self.opt_names.is_empty() || self.opt_names.contains(name) {
            self.write_line(&format!("setoption name {name} value {value}"))?;
            return Ok(true);
        }
        Ok(false)
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<String, EngineError> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Ok(line),
            Err(RecvTimeoutError::Timeout) => Err(self.fail(EngineError::Timeout {
                label: self.label.clone(),
                waited_ms: duration_to_millis(timeout),
            })),
            Err(RecvTimeoutError::Disconnected) => Err(self.fail(EngineError::Exited {
                label: self.label.clone(),
            })),
        }
    }

    fn write_line(&mut self, msg: &str) -> Result<(), EngineError> {
        let result = self
            .stdin
            .write_all(msg.as_bytes())
            .and_then(|_| self.stdin.write_all(b"\n"))
            .and_then(|_| self.stdin.flush());
        result.map_err(|source| {
            self.fail(EngineError::Io {
                label: self.label.clone(),
                source,
            })
        })
    }

    fn fail(&mut self, err: EngineError) -> EngineError {
        self.healthy = false;
        err
    }
}

impl SearchEngine for UciEngine {
    fn label(&self) -> &str {
        &self.label
    }

    fn search(&mut self, board: &BoardState, think: Duration) -> Result<SearchOutcome, EngineError> {
        // Drop anything left over from an earlier, abandoned search.
        while self.rx.try_recv().is_ok() {}

        self.write_line(&board.uci_position_command())?;
        self.write_line(&format!("go movetime {}", duration_to_millis(think).max(1)))?;

        let start = Instant::now();
        let soft_limit = think + self.search_margin;
        let hard_limit = soft_limit + self.search_margin;
        let mut stop_sent = false;
        let mut info = InfoSnapshot::default();

        loop {
            let deadline = if stop_sent { hard_limit } else { soft_limit };
            let remaining = deadline.saturating_sub(start.elapsed());
            match self.rx.recv_timeout(remaining) {
                Ok(line) => {
                    if line.starts_with("info") {
                        info.update_from_line(&line);
                        continue;
                    }
                    if let Some(rest) = line.strip_prefix("bestmove") {
                        let mv = rest.split_whitespace().next().unwrap_or_default();
                        if mv.is_empty() || mv == "(none)" || mv == "0000" {
                            return Err(self.fail(EngineError::NoBestMove {
                                label: self.label.clone(),
                            }));
                        }
                        if board.parse_uci(mv).is_none() {
                            return Err(self.fail(EngineError::IllegalMove {
                                label: self.label.clone(),
                                uci: mv.to_string(),
                            }));
                        }
                        return Ok(SearchOutcome {
                            bestmove: mv.to_string(),
                            elapsed_ms: duration_to_millis(start.elapsed()),
                            info,
                        });
                    }
                }
                Err(RecvTimeoutError::Timeout) if !stop_sent => {
                    log::warn!("{}: no bestmove after {:?}, sending stop", self.label, soft_limit);
                    self.write_line("stop")?;
                    stop_sent = true;
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(self.fail(EngineError::Timeout {
                        label: self.label.clone(),
                        waited_ms: duration_to_millis(start.elapsed()),
                    }));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.fail(EngineError::Exited {
                        label: self.label.clone(),
                    }));
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

impl Drop for UciEngine {
    fn drop(&mut self) {
        let _ = self.write_line("quit");
        let deadline = Instant::now() + ENGINE_QUIT_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            std::thread::sleep(ENGINE_QUIT_POLL_INTERVAL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Extracts the option name from the body of an `option name ... type ...` line.
pub fn parse_option_name(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    tokens.by_ref().find(|tok| *tok == "name")?;
    let parts: Vec<&str> = tokens.take_while(|tok| *tok != "type").collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

pub fn duration_to_millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_option_names_with_spaces() {
        assert_eq!(
            parse_option_name("name Hash type spin default 16 min 1 max 33554432"),
            Some("Hash".to_string())
        );
        assert_eq!(
            parse_option_name("name Clear Hash type button"),
            Some("Clear Hash".to_string())
        );
        assert_eq!(parse_option_name("type spin"), None);
    }

    #[test]
    fn info_snapshot_tracks_primary_line() {
        let mut info = InfoSnapshot::default();
        info.update_from_line("info depth 12 seldepth 18 multipv 1 score cp 34 nodes 12345 pv e2e4 e7e5");
        assert_eq!(info.depth, Some(12));
        assert_eq!(info.score_cp, Some(34));
        assert_eq!(info.nodes, Some(12345));

        info.update_from_line("info depth 12 multipv 2 score cp -80 nodes 99");
        assert_eq!(info.score_cp, Some(34));

        info.update_from_line("info depth 14 score mate 3 nodes 200");
        assert_eq!(info.score_mate, Some(3));
        assert_eq!(info.score_cp, None);
        assert_eq!(info.describe(), "depth 14 score mate 3");

        info.update_from_line("bestmove e2e4");
        assert_eq!(info.depth, Some(14));
    }

    /// Runs a scripted `sh` engine that answers every `go` with `bestmove`.
    #[cfg(unix)]
    fn scripted_engine(dir: &tempfile::TempDir, bestmove: &str) -> EngineConfig {
        let script = dir.path().join("engine.sh");
        let body = format!(
            "while read line; do\n\
             case \"$line\" in\n\
             uci) echo 'option name Hash type spin default 16'; echo uciok ;;\n\
             isready) echo readyok ;;\n\
             go*) echo 'info depth 3 score cp 12'; echo 'bestmove {bestmove}' ;;\n\
             quit) exit 0 ;;\n\
             esac\n\
             done\n"
        );
        std::fs::write(&script, body).unwrap();
        EngineConfig {
            path: "sh".into(),
            args: vec![script.display().to_string()],
            ready_timeout_secs: 5,
            search_margin_ms: 500,
            ..EngineConfig::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn scripted_engine_returns_its_move() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = UciEngine::spawn(&scripted_engine(&dir, "e2e4"), "engine#0".to_string()).unwrap();
        let outcome = engine.search(&BoardState::new(), Duration::from_millis(20)).unwrap();
        assert_eq!(outcome.bestmove, "e2e4");
        assert_eq!(outcome.info.depth, Some(3));
        assert!(engine.is_healthy());
    }

    #[cfg(unix)]
    #[test]
    fn illegal_bestmove_marks_engine_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = UciEngine::spawn(&scripted_engine(&dir, "e2e5"), "engine#0".to_string()).unwrap();
        let err = engine.search(&BoardState::new(), Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, EngineError::IllegalMove { ref uci, .. } if uci == "e2e5"));
        assert!(!engine.is_healthy());
    }

    #[cfg(unix)]
    #[test]
    fn spawn_failure_is_reported() {
        let cfg = EngineConfig {
            path: "/nonexistent/engine-binary".into(),
            ..EngineConfig::default()
        };
        let err = UciEngine::spawn(&cfg, "engine#0".to_string()).err().unwrap();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
