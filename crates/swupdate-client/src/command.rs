use std::path::PathBuf;

use rand::Rng;

/// Outcome of the previous update, reported back to the update server on
/// the next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportResult {
    Success,
    Failed,
}

impl ReportResult {
    pub fn code(self) -> &'static str {
        match self {
            Self::Success => "2",
            Self::Failed => "3",
        }
    }
}

/// Parameters for the installer's server (suricatta) mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerArgs {
    pub url: String,
    pub tenant: String,
    pub device_id: String,
    pub poll_min: u64,
    pub poll_max: u64,
    pub report: Option<ReportResult>,
}

/// Builds installer argument vectors. The first element is the program.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
    select: String,
    log_level: u8,
    blacklist: Option<String>,
    public_key: Option<PathBuf>,
}

impl CommandBuilder {
    /// `select` is the full `<collection>,<mode>-<side>` selection.
    pub fn new(program: impl Into<String>, select: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            select: select.into(),
            log_level: 5,
            blacklist: None,
            public_key: None,
        }
    }

    pub fn log_level(mut self, level: u8) -> Self {
        self.log_level = level;
        self
    }

    pub fn blacklist(mut self, blacklist: Option<String>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn public_key(mut self, path: Option<PathBuf>) -> Self {
        self.public_key = path;
        self
    }

    /// Poll an update server. The polling interval is drawn uniformly from
    /// `[poll_min, poll_max]` so a fleet does not poll in lockstep.
    pub fn server<R: Rng + ?Sized>(&self, args: &ServerArgs, rng: &mut R) -> Vec<String> {
        let (lo, hi) = if args.poll_min <= args.poll_max {
            (args.poll_min, args.poll_max)
        } else {
            (args.poll_max, args.poll_min)
        };
        let poll = rng.gen_range(lo..=hi);

        let mut server = format!(
            "-u {} -t {} -i {}",
            args.url, args.tenant, args.device_id
        );
        if let Some(report) = args.report {
            server.push_str(" -c ");
            server.push_str(report.code());
        }
        server.push_str(&format!(" -p {poll}"));

        self.build(["-u".to_string(), server])
    }

    /// Install a local image file.
    pub fn local(&self, image: &str) -> Vec<String> {
        self.build(["-i".to_string(), image.to_string()])
    }

    fn build(&self, mode: [String; 2]) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        if let Some(blacklist) = &self.blacklist {
            argv.push("-b".into());
            argv.push(blacklist.clone());
        }
        argv.push("-e".into());
        argv.push(self.select.clone());
        argv.push("-l".into());
        argv.push(self.log_level.to_string());
        argv.extend(mode);
        if let Some(key) = &self.public_key {
            argv.push("-k".into());
            argv.push(key.to_string_lossy().into_owned());
        }
        argv
    }
}
