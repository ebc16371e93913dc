//! Build-time diagnostics & timing.
//!
//! Every pipeline stage reports through a [BuildContext] instead of logging or
//! aborting. The context is the only side channel of a build: recoverable
//! degeneracies become [DiagnosticLevel::Warn] records, unrecoverable ones
//! become [DiagnosticLevel::Error] records alongside the returned error, and
//! each stage's wall-clock duration is accumulated as a [TimingRecord].

use std::time::Instant;

use bevy::math::UVec2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

/// Machine-readable reason attached to every [Diagnostic].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticCode {
    ZeroSizedGrid,
    DegenerateTriangle,
    TriangulationFallback,
    DegeneratePolygon,
    DetailCapExceeded,
    StageReport,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub code: DiagnosticCode,
    /// Pipeline stage that emitted the record, e.g. ``"rasterize"``.
    pub stage: &'static str,
    pub message: String,
    pub tile: Option<UVec2>,
}

/// A closed timing section. Nested sections are recorded independently.
#[derive(Debug, Clone)]
pub struct TimingRecord {
    pub name: &'static str,
    pub duration_micros: u64,
}

/// Collects diagnostics & timings across one tile build.
///
/// A context is cheap to create and is expected to live for exactly one build
/// call, though reusing one across builds simply appends to its streams.
#[derive(Default)]
pub struct BuildContext {
    tile: Option<UVec2>,
    diagnostics: Vec<Diagnostic>,
    timings: Vec<TimingRecord>,
    open_timers: Vec<(&'static str, Instant)>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags every subsequent diagnostic with the tile being built.
    pub fn for_tile(tile: UVec2) -> Self {
        Self {
            tile: Some(tile),
            ..Self::default()
        }
    }

    pub fn info(&mut self, stage: &'static str, code: DiagnosticCode, message: impl Into<String>) {
        self.push(DiagnosticLevel::Info, stage, code, message.into());
    }

    pub fn warn(&mut self, stage: &'static str, code: DiagnosticCode, message: impl Into<String>) {
        self.push(DiagnosticLevel::Warn, stage, code, message.into());
    }

    pub fn error(&mut self, stage: &'static str, code: DiagnosticCode, message: impl Into<String>) {
        self.push(DiagnosticLevel::Error, stage, code, message.into());
    }

    fn push(
        &mut self,
        level: DiagnosticLevel,
        stage: &'static str,
        code: DiagnosticCode,
        message: String,
    ) {
        self.diagnostics.push(Diagnostic {
            level,
            code,
            stage,
            message,
            tile: self.tile,
        });
    }

    /// Opens a named timing section. Sections nest; close in reverse order.
    pub fn start_timer(&mut self, name: &'static str) {
        self.open_timers.push((name, Instant::now()));
    }

    /// Closes the innermost open section and records its duration.
    pub fn stop_timer(&mut self) {
        if let Some((name, start)) = self.open_timers.pop() {
            self.timings.push(TimingRecord {
                name,
                duration_micros: start.elapsed().as_micros() as u64,
            });
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn timings(&self) -> &[TimingRecord] {
        &self.timings
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.level == DiagnosticLevel::Warn)
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.level == DiagnosticLevel::Error)
            .count()
    }
}
