// emit.rs — Indentation-tracked Fortran text assembly
//
// Shared by every synthesizer. Blocks are opened and closed explicitly so
// nesting in the generated code mirrors the call structure of the emitter.

use std::fmt::Write as _;

/// Longest line free-form Fortran accepts.
pub const MAX_LINE: usize = 132;

#[derive(Debug, Default)]
pub struct Emitter {
    out: String,
    depth: usize,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One line at the current indentation.
    pub fn line(&mut self, s: impl AsRef<str>) {
        let s = s.as_ref();
        if s.is_empty() {
            self.out.push('\n');
            return;
        }
        let _ = writeln!(self.out, "{:width$}{}", "", s, width = self.depth * 2);
    }

    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    pub fn comment(&mut self, s: impl AsRef<str>) {
        self.line(format!("! {}", s.as_ref()));
    }

    /// Text appended verbatim (user body, preprocessor directives).
    pub fn raw(&mut self, s: &str) {
        self.out.push_str(s);
        if !s.ends_with('\n') {
            self.out.push('\n');
        }
    }

    pub fn indent(&mut self) {
        self.depth += 1;
    }

    pub fn dedent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn open(&mut self, header: impl AsRef<str>) {
        self.line(header);
        self.indent();
    }

    pub fn close(&mut self, footer: impl AsRef<str>) {
        self.dedent();
        self.line(footer);
    }

    pub fn if_then(&mut self, cond: impl AsRef<str>) {
        self.open(format!("IF ({}) THEN", cond.as_ref()));
    }

    pub fn end_if(&mut self) {
        self.close("END IF");
    }

    /// `DO var = start, end - 1, 1`: the half-open range `[start, end)`.
    pub fn do_range(&mut self, var: &str, start: impl AsRef<str>, end: impl AsRef<str>) {
        self.open(format!("DO {} = {}, {} - 1, 1", var, start.as_ref(), end.as_ref()));
    }

    pub fn do_step(
        &mut self,
        var: &str,
        start: impl AsRef<str>,
        end: impl AsRef<str>,
        step: impl AsRef<str>,
    ) {
        self.open(format!(
            "DO {} = {}, {} - 1, {}",
            var,
            start.as_ref(),
            end.as_ref(),
            step.as_ref()
        ));
    }

    pub fn do_while(&mut self, cond: impl AsRef<str>) {
        self.open(format!("DO WHILE ({})", cond.as_ref()));
    }

    pub fn end_do(&mut self) {
        self.close("END DO");
    }

    /// A list split over continuation lines:
    ///
    /// ```text
    /// head &
    ///   & item1, &
    ///   & item2tail
    /// ```
    pub fn continued(&mut self, head: impl AsRef<str>, items: &[String], tail: &str) {
        if items.is_empty() {
            self.line(format!("{}{}", head.as_ref(), tail));
            return;
        }
        self.line(format!("{} &", head.as_ref()));
        self.indent();
        for (k, item) in items.iter().enumerate() {
            if k + 1 == items.len() {
                self.line(format!("& {}{}", item, tail));
            } else {
                self.line(format!("& {}, &", item));
            }
        }
        self.dedent();
    }

    /// `lhs = rhs`, continued when the line would pass `MAX_LINE`. The
    /// right-hand side then breaks after each top-level `+`:
    ///
    /// ```text
    /// lhs = &
    ///   & term1 + &
    ///   & term2
    /// ```
    pub fn assign(&mut self, lhs: impl AsRef<str>, rhs: impl AsRef<str>) {
        let (lhs, rhs) = (lhs.as_ref(), rhs.as_ref());
        if self.depth * 2 + lhs.len() + rhs.len() + 3 <= MAX_LINE {
            self.line(format!("{} = {}", lhs, rhs));
            return;
        }
        self.line(format!("{} = &", lhs));
        self.indent();
        let terms = top_level_terms(rhs);
        for (k, term) in terms.iter().enumerate() {
            if k + 1 == terms.len() {
                self.line(format!("& {}", term));
            } else {
                self.line(format!("& {} + &", term));
            }
        }
        self.dedent();
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// Split `expr` at ` + ` outside parentheses.
fn top_level_terms(expr: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (k, b) in expr.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b'+' if depth == 0 && expr[..k].ends_with(' ') && expr[k + 1..].starts_with(' ') => {
                out.push(&expr[start..k - 1]);
                start = k + 2;
            }
            _ => {}
        }
    }
    out.push(&expr[start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_indents_two_spaces() {
        let mut e = Emitter::new();
        e.if_then("a .EQ. 0");
        e.do_range("i1", "0", "n");
        e.line("x(i1) = 0");
        e.end_do();
        e.end_if();
        assert_eq!(
            e.finish(),
            "IF (a .EQ. 0) THEN\n  DO i1 = 0, n - 1, 1\n    x(i1) = 0\n  END DO\nEND IF\n"
        );
    }

    #[test]
    fn continued_list() {
        let mut e = Emitter::new();
        e.continued("CALL f(", &["a".to_string(), "b".to_string()], ")");
        assert_eq!(e.finish(), "CALL f( &\n  & a, &\n  & b)\n");
    }

    #[test]
    fn continued_empty_list() {
        let mut e = Emitter::new();
        e.continued("CALL f(", &[], ")");
        assert_eq!(e.finish(), "CALL f()\n");
    }

    #[test]
    fn short_assignment_stays_on_one_line() {
        let mut e = Emitter::new();
        e.assign("x(1)", "x(1) + y");
        assert_eq!(e.finish(), "x(1) = x(1) + y\n");
    }

    #[test]
    fn long_assignment_breaks_at_top_level_plus() {
        let at = format!("dat({})", "1 + i2 * stride + ".repeat(4) + "slot");
        let mut e = Emitter::new();
        e.indent();
        e.assign(&at, format!("{} + local(i2)", at));
        let text = e.finish();
        assert_eq!(
            text,
            format!("  {at} = &\n    & {at} + &\n    & local(i2)\n", at = at)
        );
        assert!(text.lines().all(|l| l.len() <= MAX_LINE));
    }

    #[test]
    fn dedent_saturates() {
        let mut e = Emitter::new();
        e.dedent();
        e.line("x");
        assert_eq!(e.depth(), 0);
        assert_eq!(e.finish(), "x\n");
    }
}
