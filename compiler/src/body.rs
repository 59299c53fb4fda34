// body.rs — Per-element kernel body and its structure-of-arrays rewrite
//
// A `KernelBody` is the user's subroutine text plus explicit references to
// its formal parameters. Each reference records the byte span of the
// occurrence, the spans of its subscripts, and whether it sits in a
// declaration statement. All rewriting is substitution over these spans.
//
// `scan` builds the structure from Fortran text; callers that already know
// the spans construct `KernelBody` directly and `check` validates them.
//
// Preconditions: `rewrite_for_device` expects a body already `check`ed
//                against the loop's argument count.
// Postconditions: every use of a rewritten formal is either left whole
//                 (no subscripts) or in `OP2_SOA(...)` form; its shaped
//                 declaration is reduced to `(*)` exactly once.
// Failure modes: E0005 (use without declaration, or a use that cannot be
//                flattened to one stride-addressed element), E0006 (bad or
//                partially overlapping spans), E0008 (formal count mismatch).
// Side effects: none.

use std::collections::HashMap;

use serde::Serialize;

use crate::diag::{codes, Diagnostic};
use crate::lexer::{self, Span, Token};

// ── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefRole {
    /// Top-level occurrence after `::` in a type declaration statement.
    Declaration,
    Use,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamRef {
    /// Index into `KernelBody::formals`.
    pub formal: usize,
    /// Identifier plus its parenthesized subscript list, if any.
    pub span: Span,
    /// One span per top-level comma-separated subscript. A declaration
    /// without its own array spec takes the statement's `DIMENSION(...)`
    /// extents, which lie outside `span`.
    pub subscripts: Vec<Span>,
    pub role: RefRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelBody {
    pub text: String,
    /// Span of the subroutine name in its header.
    pub name_span: Span,
    /// Subroutine keyword of the header; prefixed with the device attribute.
    pub header_start: usize,
    pub formals: Vec<String>,
    /// References in source order.
    pub refs: Vec<ParamRef>,
    /// The body calls other routines, so an in-place rewrite cannot reach
    /// every access.
    pub calls_routines: bool,
}

/// Per-formal rewrite request: stride-address the formal with this stride.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoaRewrite {
    pub formal: usize,
    pub stride: String,
}

// ── Scanner ────────────────────────────────────────────────────────────────

/// Scan Fortran subroutine text into a `KernelBody`.
///
/// `loop_name` only labels diagnostics. The first `subroutine` header in
/// the text is the kernel; scanning stops at its `end subroutine`.
pub fn scan(loop_name: &str, text: &str) -> Result<KernelBody, Diagnostic> {
    let lexed = lexer::lex(text);
    for e in &lexed.errors {
        log::debug!("{}: body lex error at {}: {}", loop_name, e.span.start, e.message);
    }
    let toks = &lexed.tokens;

    let header = toks
        .iter()
        .position(|(t, _)| *t == Token::Subroutine)
        .ok_or_else(|| Diagnostic::error(codes::E0008, loop_name, "body has no subroutine header"))?;
    let header_start = toks[header].1.start;

    let mut i = header + 1;
    let name_span = match toks.get(i) {
        Some((Token::Ident, span)) => *span,
        _ => {
            return Err(Diagnostic::error(
                codes::E0008,
                loop_name,
                "subroutine header has no name",
            ))
        }
    };
    i += 1;

    // Formal list, possibly continued over several lines.
    let mut formals = Vec::new();
    if matches!(toks.get(i), Some((Token::LParen, _))) {
        i += 1;
        loop {
            match toks.get(i) {
                Some((Token::Ident, span)) => formals.push(text[span.start..span.end].to_string()),
                Some((Token::Comma | Token::Amp | Token::Newline, _)) => {}
                Some((Token::RParen, _)) => {
                    i += 1;
                    break;
                }
                _ => {
                    return Err(Diagnostic::error(
                        codes::E0008,
                        loop_name,
                        "unterminated formal parameter list",
                    ))
                }
            }
            i += 1;
        }
    }

    let lookup: HashMap<String, usize> = formals
        .iter()
        .enumerate()
        .map(|(k, f)| (f.to_ascii_lowercase(), k))
        .collect();

    let mut refs = Vec::new();
    let mut calls_routines = false;
    for stmt in statements(&toks[i..]) {
        if matches!(stmt.first(), Some((Token::End, _)))
            && matches!(stmt.get(1), Some((Token::Subroutine, _)))
        {
            break;
        }
        if stmt.iter().any(|(t, _)| *t == Token::Call) {
            calls_routines = true;
        }
        let decl_at = stmt.iter().position(|(t, _)| *t == Token::DoubleColon);
        // Paren depth; references nested in subscripts are always uses.
        let mut depth = 0usize;
        for (k, &(tok, span)) in stmt.iter().enumerate() {
            match tok {
                Token::LParen => depth += 1,
                Token::RParen => depth = depth.saturating_sub(1),
                _ => {}
            }
            let after_percent = k > 0 && stmt[k - 1].0 == Token::Percent;
            let formal = if tok == Token::Ident && !after_percent {
                lookup.get(&text[span.start..span.end].to_ascii_lowercase()).copied()
            } else {
                None
            };
            let Some(formal) = formal else {
                continue;
            };
            let role = match decl_at {
                Some(d) if k > d && depth == 0 => RefRole::Declaration,
                _ => RefRole::Use,
            };
            let (mut subscripts, end, _) =
                subscript_list(&stmt, k + 1).unwrap_or((Vec::new(), span.end, k + 1));
            if role == RefRole::Declaration && subscripts.is_empty() {
                subscripts = dimension_attribute(text, &stmt[..decl_at.unwrap_or(0)]);
            }
            refs.push(ParamRef {
                formal,
                span: Span::new(span.start, end),
                subscripts,
                role,
            });
        }
    }

    Ok(KernelBody {
        text: text.to_string(),
        name_span,
        header_start,
        formals,
        refs,
        calls_routines,
    })
}

/// Array spec of a `DIMENSION(...)` attribute among declaration attributes.
fn dimension_attribute(text: &str, attrs: &[(Token, Span)]) -> Vec<Span> {
    attrs
        .iter()
        .position(|(t, s)| *t == Token::Ident && text[s.start..s.end].eq_ignore_ascii_case("dimension"))
        .and_then(|at| subscript_list(attrs, at + 1))
        .map(|(subs, _, _)| subs)
        .unwrap_or_default()
}

/// Split tokens into statements. A statement ends at a newline or `;`
/// unless the line ends with `&`; a leading `&` on a continuation line is
/// dropped.
fn statements(toks: &[(Token, Span)]) -> Vec<Vec<(Token, Span)>> {
    let mut out = Vec::new();
    let mut cur: Vec<(Token, Span)> = Vec::new();
    let mut continued = false;
    let mut line_start = true;
    for &(tok, span) in toks {
        match tok {
            Token::Newline => {
                if continued {
                    continued = false;
                } else if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
                line_start = true;
            }
            Token::Semicolon => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            Token::Amp if line_start => {
                line_start = false;
            }
            Token::Amp => {
                continued = true;
            }
            _ => {
                cur.push((tok, span));
                line_start = false;
            }
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// If `stmt[at]` opens a parenthesized list, return its top-level subscript
/// spans, the byte end of the closing parenthesis, and the token index past it.
fn subscript_list(stmt: &[(Token, Span)], at: usize) -> Option<(Vec<Span>, usize, usize)> {
    if !matches!(stmt.get(at), Some((Token::LParen, _))) {
        return None;
    }
    let mut depth = 0usize;
    let mut subs = Vec::new();
    let mut first: Option<usize> = None;
    let mut last = 0usize;
    for (j, &(tok, span)) in stmt.iter().enumerate().skip(at) {
        match tok {
            Token::LParen => {
                depth += 1;
                if depth == 1 {
                    continue;
                }
            }
            Token::RParen => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = first {
                        subs.push(Span::new(s, last));
                    }
                    return Some((subs, span.end, j + 1));
                }
            }
            Token::Comma if depth == 1 => {
                if let Some(s) = first.take() {
                    subs.push(Span::new(s, last));
                }
                continue;
            }
            _ => {}
        }
        first.get_or_insert(span.start);
        last = span.end;
    }
    None
}

// ── Validation ─────────────────────────────────────────────────────────────

impl KernelBody {
    /// Check spans and that the formal list matches the loop's arguments.
    pub fn check(&self, loop_name: &str, nargs: usize) -> Result<(), Diagnostic> {
        if self.formals.len() != nargs {
            return Err(Diagnostic::error(
                codes::E0008,
                loop_name,
                format!(
                    "body has {} formal parameters, loop has {} arguments",
                    self.formals.len(),
                    nargs
                ),
            ));
        }
        let len = self.text.len();
        let in_text = |s: &Span| {
            s.start <= s.end
                && s.end <= len
                && self.text.is_char_boundary(s.start)
                && self.text.is_char_boundary(s.end)
        };
        if !in_text(&self.name_span) || self.header_start > self.name_span.start {
            return Err(Diagnostic::error(
                codes::E0006,
                loop_name,
                "subroutine name span outside body text",
            ));
        }
        // References may nest inside an enclosing reference's subscripts;
        // otherwise they are ordered and disjoint.
        let mut open: Vec<&ParamRef> = Vec::new();
        let mut prev_start = self.name_span.end;
        for r in &self.refs {
            if r.formal >= self.formals.len() {
                return Err(Diagnostic::error(
                    codes::E0006,
                    loop_name,
                    format!("reference to formal {} which does not exist", r.formal + 1),
                ));
            }
            while open.last().is_some_and(|p| p.span.end <= r.span.start) {
                open.pop();
            }
            let nested_ok = open
                .last()
                .map_or(true, |p| p.subscripts.iter().any(|s| s.contains(&r.span)));
            if !in_text(&r.span) || r.span.start < prev_start || !nested_ok {
                return Err(Diagnostic::error(
                    codes::E0006,
                    loop_name,
                    format!("reference span {}..{} out of range or overlapping", r.span.start, r.span.end),
                )
                .with_arg(r.formal));
            }
            let misplaced = |s: &Span| match r.role {
                RefRole::Use => !r.span.contains(s),
                RefRole::Declaration => !in_text(s),
            };
            if r.subscripts.iter().any(misplaced) {
                return Err(Diagnostic::error(
                    codes::E0006,
                    loop_name,
                    "subscript span outside its reference",
                )
                .with_arg(r.formal));
            }
            prev_start = r.span.start;
            open.push(r);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.text[self.name_span.start..self.name_span.end]
    }

    fn slice(&self, span: Span) -> &str {
        self.text[span.start..span.end].trim()
    }

    /// Rewrite the body into its device form: stride-addressed SoA formals,
    /// `attributes(device)` on the header, and the subroutine renamed to
    /// `device_name`.
    pub fn rewrite_for_device(
        &self,
        loop_name: &str,
        device_name: &str,
        soa: &[SoaRewrite],
    ) -> Result<String, Diagnostic> {
        let mut edits: Vec<Edit> = vec![
            Edit::literal(Span::new(self.header_start, self.header_start), "attributes(device) "),
            Edit::literal(self.name_span, device_name),
        ];
        for req in soa {
            edits.extend(self.soa_edits(loop_name, req)?);
        }
        edits.sort_by_key(|e| (e.span.start, e.span.end));

        let mut out = String::with_capacity(self.text.len() + 64 * edits.len());
        self.render(Span::new(0, self.text.len()), &edits, &mut out);
        Ok(out)
    }

    /// Copy `range` into `out`, applying the outermost edits inside it.
    /// Source pieces of an edit recurse, so nested references are
    /// rewritten inside their enclosing rewrite.
    fn render(&self, range: Span, edits: &[Edit], out: &mut String) {
        let mut pos = range.start;
        for edit in edits {
            if edit.span.start < pos || !range.contains(&edit.span) {
                continue;
            }
            out.push_str(&self.text[pos..edit.span.start]);
            for piece in &edit.pieces {
                match piece {
                    Piece::Text(t) => out.push_str(t),
                    Piece::Source(s) => self.render(*s, edits, out),
                }
            }
            pos = edit.span.end;
        }
        out.push_str(&self.text[pos..range.end]);
    }

    fn soa_edits(&self, loop_name: &str, req: &SoaRewrite) -> Result<Vec<Edit>, Diagnostic> {
        let formal = &self.formals[req.formal];
        let refs: Vec<&ParamRef> = self.refs.iter().filter(|r| r.formal == req.formal).collect();
        let shaped: Vec<&&ParamRef> = refs
            .iter()
            .filter(|r| r.role == RefRole::Declaration && !r.subscripts.is_empty())
            .collect();
        let declared = refs.iter().any(|r| r.role == RefRole::Declaration);
        let used = refs.iter().any(|r| r.role == RefRole::Use);

        if used && !declared {
            return Err(Diagnostic::error(
                codes::E0005,
                loop_name,
                format!("'{}' is used but never declared", formal),
            )
            .with_arg(req.formal)
            .with_hint("declare the parameter with '::' so its shape is known"));
        }
        if shaped.len() > 1 {
            return Err(Diagnostic::error(
                codes::E0005,
                loop_name,
                format!("'{}' is declared with a shape more than once", formal),
            )
            .with_arg(req.formal));
        }

        let mut edits = Vec::new();
        // Leading extent of a multi-subscript declaration, used to flatten
        // two-subscript uses.
        let mut leading: Option<String> = None;
        if let Some(decl) = shaped.first() {
            if decl.subscripts.len() > 1 {
                leading = Some(self.slice(decl.subscripts[0]).to_string());
            }
            // An entity array spec overrides a DIMENSION attribute, so the
            // bare-pointer form is always written on the entity itself.
            let ident_end = decl.span.start + formal.len();
            edits.push(Edit::literal(Span::new(ident_end, decl.span.end), "(*)"));
        }

        for r in refs.iter().filter(|r| r.role == RefRole::Use) {
            if r.subscripts.is_empty() {
                continue;
            }
            let name = &self.text[r.span.start..r.span.start + formal.len()];
            let unflattenable = |why: String| {
                Diagnostic::error(
                    codes::E0005,
                    loop_name,
                    format!("'{}' at byte {} {}", self.slice(r.span), r.span.start, why),
                )
                .with_arg(req.formal)
                .with_hint("index one element per subscript so the access can be stride-addressed")
            };
            if let Some(sec) = r.subscripts.iter().find(|s| is_section(self.slice(**s))) {
                return Err(unflattenable(format!(
                    "uses the array section '{}'",
                    self.slice(*sec)
                )));
            }
            let mut pieces = vec![Piece::Text(format!("OP2_SOA({},", name))];
            match (r.subscripts.as_slice(), &leading) {
                ([c], _) => pieces.push(Piece::Source(*c)),
                ([a, b], Some(l)) => {
                    pieces.push(Piece::Source(*a));
                    pieces.push(Piece::Text("+(".to_string()));
                    pieces.push(Piece::Source(*b));
                    pieces.push(Piece::Text(format!("-1)*{}", l)));
                }
                (subs, _) => {
                    return Err(unflattenable(format!(
                        "has {} subscripts; the declaration supports {}",
                        subs.len(),
                        if leading.is_some() { 2 } else { 1 }
                    )));
                }
            }
            pieces.push(Piece::Text(format!(", {})", req.stride)));
            edits.push(Edit { span: r.span, pieces });
        }
        Ok(edits)
    }
}

/// Replacement for one span.
#[derive(Debug, Clone)]
struct Edit {
    span: Span,
    pieces: Vec<Piece>,
}

#[derive(Debug, Clone)]
enum Piece {
    Text(String),
    /// Original text of this span, with nested edits applied.
    Source(Span),
}

impl Edit {
    fn literal(span: Span, text: &str) -> Self {
        Edit {
            span,
            pieces: vec![Piece::Text(text.to_string())],
        }
    }
}

/// A subscript with a top-level `:` selects a section, not an element.
fn is_section(subscript: &str) -> bool {
    let mut depth = 0i32;
    for ch in subscript.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ':' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES_CALC: &str = "subroutine res_calc(x1, q, &
     & res, rms)
  implicit none
  real(8), dimension(2) :: x1
  real(8), dimension(4,2) :: q
  real(8) :: res(4)
  real(8) :: rms
  ! q(9) in a comment is not a reference
  res(1) = q(1,2) + x1(2)
  rms = rms + res(1)*res(1)
end subroutine
";

    #[test]
    fn scan_header_and_formals() {
        let body = scan("res_calc", RES_CALC).unwrap();
        assert_eq!(body.name(), "res_calc");
        assert_eq!(body.formals, vec!["x1", "q", "res", "rms"]);
        assert!(!body.calls_routines);
        assert!(body.check("res_calc", 4).is_ok());
    }

    #[test]
    fn scan_roles_and_subscripts() {
        let body = scan("res_calc", RES_CALC).unwrap();
        let q: Vec<&ParamRef> = body.refs.iter().filter(|r| r.formal == 1).collect();
        assert_eq!(q.len(), 2);
        assert_eq!(q[0].role, RefRole::Declaration);
        assert_eq!(&body.text[q[0].span.start..q[0].span.end], "q");
        assert_eq!(q[0].subscripts.len(), 2);
        assert_eq!(&body.text[q[0].subscripts[0].start..q[0].subscripts[0].end], "4");
        assert_eq!(q[1].role, RefRole::Use);
        assert_eq!(&body.text[q[1].span.start..q[1].span.end], "q(1,2)");
        assert_eq!(q[1].subscripts.len(), 2);

        let res: Vec<&ParamRef> = body.refs.iter().filter(|r| r.formal == 2).collect();
        assert_eq!(res[0].role, RefRole::Declaration);
        assert_eq!(&body.text[res[0].span.start..res[0].span.end], "res(4)");
    }

    #[test]
    fn component_access_is_not_a_reference() {
        let text = "subroutine k(x)\n  real(8) :: x(2)\n  y = hyd%x + x(1)\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let uses: Vec<&ParamRef> = body.refs.iter().filter(|r| r.role == RefRole::Use).collect();
        assert_eq!(uses.len(), 1);
        assert_eq!(&text[uses[0].span.start..uses[0].span.end], "x(1)");
    }

    #[test]
    fn call_detected() {
        let text = "SUBROUTINE k(a)\n  REAL(8) :: a(3)\n  CALL helper(a)\nEND SUBROUTINE\n";
        assert!(scan("k", text).unwrap().calls_routines);
    }

    #[test]
    fn rewrite_two_subscript_declaration() {
        let text = "subroutine k(a)\n  real(8) :: a(3,2)\n  a(1,2) = a(3,1)\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let out = body
            .rewrite_for_device(
                "k",
                "k_gpu",
                &[SoaRewrite {
                    formal: 0,
                    stride: "direct_stride_OP2CONSTANT".into(),
                }],
            )
            .unwrap();
        assert!(out.starts_with("attributes(device) subroutine k_gpu(a)"));
        assert!(out.contains("real(8) :: a(*)"));
        assert!(out.contains(
            "OP2_SOA(a,1+(2-1)*3, direct_stride_OP2CONSTANT) = OP2_SOA(a,3+(1-1)*3, direct_stride_OP2CONSTANT)"
        ));
    }

    #[test]
    fn rewrite_single_subscript() {
        let text = "subroutine k(a, b)\n  real(8), intent(in) :: b\n  real(8) :: a(4)\n  a(2) = b\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let out = body
            .rewrite_for_device(
                "k",
                "k_gpu",
                &[SoaRewrite {
                    formal: 0,
                    stride: "opMap1_stride_OP2CONSTANT".into(),
                }],
            )
            .unwrap();
        assert!(out.contains("real(8) :: a(*)"));
        assert!(out.contains("OP2_SOA(a,2, opMap1_stride_OP2CONSTANT) = b"));
    }

    #[test]
    fn rewrite_dimension_attribute_declaration() {
        let body = scan("res_calc", RES_CALC).unwrap();
        let out = body
            .rewrite_for_device(
                "res_calc",
                "res_calc_gpu",
                &[SoaRewrite {
                    formal: 1,
                    stride: "opMap1_stride_OP2CONSTANT".into(),
                }],
            )
            .unwrap();
        assert!(out.contains("real(8), dimension(4,2) :: q(*)"));
        assert!(out.contains("res(1) = OP2_SOA(q,1+(2-1)*4, opMap1_stride_OP2CONSTANT) + x1(2)"));
    }

    #[test]
    fn whole_array_use_left_unchanged() {
        let text = "subroutine k(a)\n  real(8) :: a(4)\n  a = 0.0\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let out = body
            .rewrite_for_device("k", "k_gpu", &[SoaRewrite { formal: 0, stride: "s".into() }])
            .unwrap();
        assert!(out.contains("\n  a = 0.0\n"));
    }

    #[test]
    fn undeclared_soa_use_is_fatal() {
        let text = "subroutine k(a)\n  a(1) = 0.0\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let err = body
            .rewrite_for_device("k", "k_gpu", &[SoaRewrite { formal: 0, stride: "s".into() }])
            .unwrap_err();
        assert_eq!(err.code, Some(codes::E0005));
        assert_eq!(err.arg, Some(0));
    }

    #[test]
    fn nested_use_rewritten_inside_subscript() {
        let text = "subroutine k(x, a)\n  real(8) :: x(4)\n  real(8) :: a(2)\n  x(1) = x(int(a(2)))\nend subroutine\n";
        let body = scan("k", text).unwrap();
        assert!(body.check("k", 2).is_ok());
        let nested: Vec<&ParamRef> = body.refs.iter().filter(|r| r.formal == 1).collect();
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[1].role, RefRole::Use);
        assert_eq!(&text[nested[1].span.start..nested[1].span.end], "a(2)");

        let out = body
            .rewrite_for_device("k", "k_gpu", &[SoaRewrite { formal: 1, stride: "s".into() }])
            .unwrap();
        assert!(out.contains("x(1) = x(int(OP2_SOA(a,2, s)))"));
    }

    #[test]
    fn nested_uses_of_both_formals_compose() {
        let text = "subroutine k(x, a)\n  real(8) :: x(4)\n  real(8) :: a(2)\n  x(1) = x(int(a(2)))\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let out = body
            .rewrite_for_device(
                "k",
                "k_gpu",
                &[
                    SoaRewrite { formal: 0, stride: "sx".into() },
                    SoaRewrite { formal: 1, stride: "sa".into() },
                ],
            )
            .unwrap();
        assert!(out.contains("OP2_SOA(x,1, sx) = OP2_SOA(x,int(OP2_SOA(a,2, sa)), sx)"));
    }

    #[test]
    fn rank_three_use_is_fatal() {
        let text = "subroutine k(a)\n  real(8) :: a(3,2)\n  a(1,2,2) = 0.0\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let err = body
            .rewrite_for_device("k", "k_gpu", &[SoaRewrite { formal: 0, stride: "s".into() }])
            .unwrap_err();
        assert_eq!(err.code, Some(codes::E0005));
        assert!(err.message.contains("a(1,2,2)"));
    }

    #[test]
    fn two_subscripts_on_rank_one_declaration_is_fatal() {
        let text = "subroutine k(a)\n  real(8) :: a(6)\n  a(1,2) = 0.0\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let err = body
            .rewrite_for_device("k", "k_gpu", &[SoaRewrite { formal: 0, stride: "s".into() }])
            .unwrap_err();
        assert_eq!(err.code, Some(codes::E0005));
    }

    #[test]
    fn array_section_use_is_fatal() {
        let text = "subroutine k(a)\n  real(8) :: a(4)\n  a(1:2) = 0.0\nend subroutine\n";
        let body = scan("k", text).unwrap();
        let err = body
            .rewrite_for_device("k", "k_gpu", &[SoaRewrite { formal: 0, stride: "s".into() }])
            .unwrap_err();
        assert_eq!(err.code, Some(codes::E0005));
        assert!(err.message.contains("1:2"));
    }

    #[test]
    fn partially_overlapping_span_rejected() {
        let text = "subroutine k(x, a)\n  real(8) :: x(4)\n  real(8) :: a(2)\n  x(1) = x(int(a(2)))\nend subroutine\n";
        let mut body = scan("k", text).unwrap();
        let inner = body
            .refs
            .iter()
            .position(|r| r.formal == 1 && r.role == RefRole::Use)
            .unwrap();
        // Stretch the nested reference past its enclosing subscript.
        body.refs[inner].span.end = text.find("\nend").unwrap();
        assert_eq!(body.check("k", 2).unwrap_err().code, Some(codes::E0006));
    }

    #[test]
    fn formal_count_mismatch() {
        let body = scan("res_calc", RES_CALC).unwrap();
        assert_eq!(body.check("res_calc", 3).unwrap_err().code, Some(codes::E0008));
    }

    #[test]
    fn overlapping_spans_rejected() {
        let mut body = scan("res_calc", RES_CALC).unwrap();
        let dup = body.refs[0].clone();
        body.refs.insert(1, dup);
        assert_eq!(body.check("res_calc", 4).unwrap_err().code, Some(codes::E0006));
    }

    #[test]
    fn no_header_rejected() {
        assert!(scan("k", "x = 1\n").is_err());
    }
}
