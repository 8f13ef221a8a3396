//! Compiler configuration, narrowed from the teacher's extensibility
//! config (`seqc::CompilerConfig`) to the knobs this pipeline actually
//! has: this compiler has no externally-registerable builtins (the
//! opcode set is fixed, §6), so what remains is the frame-stack
//! top-level mode, the too-deep nesting budget, and the optimizer's
//! dead-code fixed-point cap.

/// Configuration for a single compilation run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerConfig {
    /// When `true`, a bare expression statement at the top level leaves
    /// its value on the frame-stack instead of discarding it (§4.5,
    /// "Statement forms"). Used by embedders that want the script's
    /// trailing expression as its result (e.g. a REPL).
    pub extend_mode: bool,

    /// Nesting budget backing the "syntax-too-deep" error kind (§7):
    /// recursive-descent depth and the with/loop/frame-stack nesting
    /// counters are all checked against this.
    pub max_nesting: usize,

    /// Maximum number of dead-code-elimination fixed-point iterations
    /// before the optimizer gives up and keeps the current result
    /// (§4.6).
    pub dce_max_iterations: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig { extend_mode: false, max_nesting: 200, dce_max_iterations: 8 }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_extend_mode(mut self, extend_mode: bool) -> Self {
        self.extend_mode = extend_mode;
        self
    }

    pub fn with_max_nesting(mut self, max_nesting: usize) -> Self {
        self.max_nesting = max_nesting;
        self
    }

    pub fn with_dce_max_iterations(mut self, n: usize) -> Self {
        self.dce_max_iterations = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = CompilerConfig::default();
        assert!(!c.extend_mode);
        assert_eq!(c.dce_max_iterations, 8);
    }

    #[test]
    fn builder_methods_chain() {
        let c = CompilerConfig::new().with_extend_mode(true).with_max_nesting(50);
        assert!(c.extend_mode);
        assert_eq!(c.max_nesting, 50);
    }
}
