//! Worker side of the engine
//!
//! Workers serve the requests that jobs send: line comparison, changed-line
//! analysis, language detection and syntax highlighting. A worker runs as a
//! pub/sub service ([`serve`]) or as a child process speaking framed records
//! over its standard streams ([`serve_stdio`], driven by [`WorkerProcess`]).

pub mod analysis;
pub mod diff;
pub mod handlers;
pub mod highlight;
pub mod language;
pub mod process;
pub mod service;
pub mod writer;

pub use handlers::{
    AnalyzeRequest, AnalyzeResponse, BlockToAnalyze, DetectLanguagesRequest, DetectedLanguage,
    FileDifferenceRequest, FileVersions, Handlers, HighlightRequest, HighlightResponse,
    VersionToDetect,
};
pub use language::Language;
pub use process::{
    serve_stdio, CommandRecord, LogRecord, ResponseBody, ResponseRecord, WorkerProcess,
};
pub use service::serve;
pub use writer::{BatchWriter, WriteItem, WriterError};

/// Line-level comparison of modified files
pub const CALCULATE_FILE_DIFFERENCE: &str = "calculatefiledifference";

/// Source-based language detection
pub const DETECT_FILE_LANGUAGES: &str = "detectfilelanguages";

/// Alignment of modified blocks
pub const ANALYZE_CHANGED_LINES: &str = "analyzechangedlines";

/// Tokenising of one file version
pub const SYNTAX_HIGHLIGHT_FILE: &str = "syntaxhighlightfile";

/// Every channel a worker can serve
pub const CHANNELS: [&str; 4] = [
    CALCULATE_FILE_DIFFERENCE,
    DETECT_FILE_LANGUAGES,
    ANALYZE_CHANGED_LINES,
    SYNTAX_HIGHLIGHT_FILE,
];
