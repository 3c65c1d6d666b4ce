//! The deparser and descanner: parse tree -> token stream -> canonical text.
//!
//! The deparser walks a tree emitting tokens with `eol`/`indent`/`exdent`
//! formatting; the descanner renders those into lines bounded by a maximum
//! width, wrapping when tokens do not fit. Identifier casing is canonical by
//! role: reserved words upper, operations lower, variables and expressions
//! capitalized, transformers upper. Output re-scans and re-parses to a
//! structurally equivalent tree.

use crate::{
    interp::Interpreter,
    parse::literal_text,
    parsetree::{Node, TreeId, NULLTREE},
    symtab::{EntryId, Role, SymtabId},
    token::{TokenProp, TokenStream},
};

/// Indentation amount applied per structure level.
const INDENT_AMOUNT: usize = 3;
/// Indentation applied to wrapped comment lines.
const COMMENT_INDENT: usize = 2;
/// Default display width.
pub(crate) const DESCAN_WIDTH: usize = 72;

/// Deparses a tree into display text bounded by `width` columns.
pub(crate) fn deparse_to_text(interp: &Interpreter, tree: TreeId, width: usize) -> String {
    let stream = deparse(interp, tree);
    descan(&stream, width).join("\n")
}

/// Walks a parse tree, emitting a token stream with formatting tokens.
pub(crate) fn deparse(interp: &Interpreter, tree: TreeId) -> TokenStream {
    let mut stream = TokenStream::new();
    let mut walker = Deparser { interp, out: &mut stream };
    walker.node(tree);
    stream
}

struct Deparser<'a> {
    interp: &'a Interpreter,
    out: &'a mut TokenStream,
}

impl<'a> Deparser<'a> {
    fn delim(&mut self, text: &str) {
        self.out.push(TokenProp::Delim, text);
    }

    fn ident(&mut self, text: String) {
        self.out.push(TokenProp::Identifier, text);
    }

    fn eol(&mut self) {
        self.out.push(TokenProp::Eol, "");
    }

    fn indent(&mut self) {
        self.out.push(TokenProp::Indent, "");
    }

    fn exdent(&mut self) {
        self.out.push(TokenProp::Exdent, "");
    }

    /// Canonical casing of a name by its role.
    fn cased_name(&self, sym: SymtabId, entry: EntryId) -> String {
        let info = self.interp.symtabs.get(sym).entry(entry);
        let name = self.interp.interns.phrase_text(info.name);
        case_by_role(name, info.role)
    }

    fn node(&mut self, tree: TreeId) {
        match self.interp.trees.node(tree) {
            Node::Nulltree => {}
            Node::Constant { token, .. } => {
                let text = self.interp.interns.phrase_text(token).to_owned();
                self.out.push(TokenProp::Identifier, text);
            }
            Node::Variable { sym, entry } | Node::Expression { sym, entry } => {
                let name = self.cased_name(sym, entry);
                self.ident(name);
            }
            Node::Identifier { name, .. } => {
                let text = capitalized(self.interp.interns.phrase_text(name));
                self.ident(text);
            }
            Node::BasicOp { op } => self.ident(op.word_name().to_owned()),
            Node::BasicTr { tr } => self.ident(tr.name().to_owned()),
            Node::Opcall { op, arg } => {
                self.node(op);
                self.node(arg);
            }
            Node::BasicBinop { op, left, right } => {
                self.node(left);
                let text = op.symbol().unwrap_or(op.word_name());
                self.ident(text.to_owned());
                self.node(right);
            }
            Node::Curried { op, arg } => {
                self.node(arg);
                self.node(op);
            }
            Node::Vcurried { op, value } => {
                let text = literal_text(&value, &self.interp.interns);
                self.ident(text);
                self.node(op);
            }
            Node::Composition { items } | Node::Strand { items } => {
                for item in items {
                    self.node(item);
                }
            }
            Node::Atlas { items } | Node::List { items } => {
                self.delim("[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.delim(",");
                    }
                    self.node(*item);
                }
                self.delim("]");
            }
            Node::ExprSeq { items } | Node::DefnSeq { items } => self.sequence(&items),
            Node::Action { defs, exprs } => {
                self.node(defs);
                self.delim(";");
                self.eol();
                self.node(exprs);
            }
            Node::Definition { idlist, value, .. } => {
                self.node(idlist);
                self.delim("IS");
                self.node(value);
            }
            Node::ExtDeclaration { idlist, role } => {
                self.node(idlist);
                self.delim("IS");
                self.delim("EXTERNAL");
                self.delim(match role {
                    Role::Expr => "EXPRESSION",
                    Role::Optn => "OPERATION",
                    Role::Trans => "TRANSFORMER",
                    _ => "VARIABLE",
                });
            }
            Node::AssignExpr { idlist, expr } => {
                self.node(idlist);
                self.delim(":=");
                self.node(expr);
            }
            Node::IfExpr { arms, else_expr } => {
                for (i, (test, body)) in arms.iter().enumerate() {
                    self.delim(if i == 0 { "IF" } else { "ELSEIF" });
                    self.node(*test);
                    self.delim("THEN");
                    self.indent();
                    self.eol();
                    self.node(*body);
                    self.exdent();
                    self.eol();
                }
                if let Some(body) = else_expr {
                    self.delim("ELSE");
                    self.indent();
                    self.eol();
                    self.node(body);
                    self.exdent();
                    self.eol();
                }
                self.delim("ENDIF");
            }
            Node::WhileExpr { test, body } => {
                self.delim("WHILE");
                self.node(test);
                self.delim("DO");
                self.indent();
                self.eol();
                self.node(body);
                self.exdent();
                self.eol();
                self.delim("ENDWHILE");
            }
            Node::RepeatExpr { body, test } => {
                self.delim("REPEAT");
                self.indent();
                self.eol();
                self.node(body);
                self.exdent();
                self.eol();
                self.delim("UNTIL");
                self.node(test);
                self.delim("ENDREPEAT");
            }
            Node::ForExpr { idlist, iter, body } => {
                self.delim("FOR");
                self.node(idlist);
                self.delim("WITH");
                self.node(iter);
                self.delim("DO");
                self.indent();
                self.eol();
                self.node(body);
                self.exdent();
                self.eol();
                self.delim("ENDFOR");
            }
            Node::CaseExpr {
                selector,
                labels,
                bodies,
                ..
            } => {
                self.delim("CASE");
                self.node(selector);
                self.delim("FROM");
                self.indent();
                self.eol();
                for (label, body) in labels.iter().zip(&bodies) {
                    self.node(*label);
                    self.delim(":");
                    self.node(*body);
                    self.delim("END");
                    self.eol();
                }
                if let Some(&else_body) = bodies.last() {
                    if else_body != NULLTREE && bodies.len() > labels.len() {
                        self.delim("ELSE");
                        self.node(else_body);
                        self.eol();
                    }
                }
                self.exdent();
                self.delim("ENDCASE");
            }
            Node::ExitExpr { expr } => {
                self.delim("EXIT");
                self.node(expr);
            }
            Node::Block { body, .. } => {
                self.delim("{");
                self.block_body(body);
                self.delim("}");
            }
            Node::BlockBody { .. } => self.block_body(tree),
            Node::Opform { args, body, .. } => {
                self.delim("OP");
                self.node(args);
                match self.interp.trees.node(body) {
                    Node::BlockBody { .. } => {
                        self.delim("{");
                        self.block_body(body);
                        self.delim("}");
                    }
                    // An expression body already carries its parentheses.
                    Node::Parendobj { .. } => self.node(body),
                    _ => {
                        self.delim("(");
                        self.node(body);
                        self.delim(")");
                    }
                }
            }
            Node::Trform { opargs, body, .. } => {
                self.delim("TR");
                self.node(opargs);
                self.node(body);
            }
            Node::Transform { tr, op } => {
                self.node(tr);
                self.node(op);
            }
            Node::Idlist { ids } => {
                for id in ids {
                    self.node(id);
                }
            }
            Node::CommentExpr { text } => {
                let comment = self.interp.interns.phrase_text(text).to_owned();
                self.out.push(TokenProp::Comment, comment);
            }
            Node::Parendobj { expr } => {
                self.delim("(");
                self.node(expr);
                self.delim(")");
            }
            Node::Dottedobj { expr } => self.node(expr),
            Node::ScopedVar { fun, var } => {
                self.node(fun);
                self.delim(":");
                let text = capitalized(self.interp.interns.phrase_text(var));
                self.ident(text);
            }
            Node::IndexedAssign { target, expr } => {
                self.node(target);
                self.delim(":=");
                self.node(expr);
            }
            Node::PickPlace { var, index } => {
                self.node(var);
                self.delim("@");
                self.node(index);
            }
            Node::ReachPut { var, index } => {
                self.node(var);
                self.delim("@");
                self.delim("@");
                self.node(index);
            }
            Node::SliceSel { var, index } => {
                self.node(var);
                self.delim("|");
                self.node(index);
            }
            Node::ChooseSel { var, index } => {
                self.node(var);
                self.delim("#");
                self.node(index);
            }
            Node::Cast { tree } => {
                self.delim("!");
                match self.interp.trees.node(tree) {
                    Node::Variable { .. } | Node::Expression { .. } => self.node(tree),
                    _ => {
                        self.delim("(");
                        self.node(tree);
                        self.delim(")");
                    }
                }
            }
        }
    }

    fn sequence(&mut self, items: &[TreeId]) {
        for (i, &item) in items.iter().enumerate() {
            if i > 0 {
                self.delim(";");
                self.eol();
            }
            self.node(item);
        }
    }

    fn block_body(&mut self, body: TreeId) {
        let Node::BlockBody {
            locals,
            nonlocals,
            defs,
            seq,
        } = self.interp.trees.node(body)
        else {
            self.node(body);
            return;
        };
        self.indent();
        if !self.idlist_is_empty(locals) {
            self.delim("LOCAL");
            self.node(locals);
            self.delim(";");
            self.eol();
        }
        if !self.idlist_is_empty(nonlocals) {
            self.delim("NONLOCAL");
            self.node(nonlocals);
            self.delim(";");
            self.eol();
        }
        if let Some(defs) = defs {
            self.node(defs);
            self.delim(";");
            self.eol();
        }
        self.node(seq);
        self.exdent();
    }

    fn idlist_is_empty(&self, idlist: TreeId) -> bool {
        match self.interp.trees.node(idlist) {
            Node::Idlist { ids } => ids.is_empty(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resource::HeapLimits, scan};

    fn parse_src(interp: &mut Interpreter, src: &str) -> TreeId {
        let stream = scan::scan_lines(std::iter::once(src), &interp.symtabs, &interp.interns)
            .expect("test source scans");
        crate::parse::parse(interp, &stream, false).expect("test source parses")
    }

    fn reparse(interp: &mut Interpreter, text: &str) -> TreeId {
        let stream = scan::scan_lines(text.lines(), &interp.symtabs, &interp.interns)
            .expect("deparsed text scans");
        crate::parse::parse(interp, &stream, false).expect("deparsed text parses")
    }

    /// Parse/deparse round trip: deparsing, reparsing and deparsing again
    /// is a fixed point, so the reparsed tree is structurally equivalent.
    fn assert_round_trip(src: &str) {
        let mut interp = Interpreter::new(HeapLimits::default());
        let first = parse_src(&mut interp, src);
        let text1 = deparse_to_text(&interp, first, DESCAN_WIDTH);
        let second = reparse(&mut interp, &text1);
        let text2 = deparse_to_text(&interp, second, DESCAN_WIDTH);
        assert_eq!(text1, text2, "source: {src}");
    }

    #[test]
    fn expressions_round_trip() {
        assert_round_trip("1 + 2");
        assert_round_trip("[1, 2, 3]");
        assert_round_trip("2 3 reshape count 6");
        assert_round_trip("opposite abs -7");
        assert_round_trip("a := 5");
    }

    #[test]
    fn control_structures_round_trip() {
        assert_round_trip("IF l THEN 1 ELSE 2 ENDIF");
        assert_round_trip("a := 0; WHILE a < 3 DO a := a + 1 ENDWHILE");
        assert_round_trip("REPEAT 1 UNTIL l ENDREPEAT");
        assert_round_trip("FOR i WITH count 3 DO i + 1 ENDFOR");
        assert_round_trip("x := 1; CASE x FROM 1 : 'one' END ELSE 'other' ENDCASE");
    }

    #[test]
    fn definitions_round_trip() {
        assert_round_trip("inc IS OP a (a + 1)");
        assert_round_trip("addup IS OP a b (a + b)");
        assert_round_trip("apply2 IS TR f OP x (f (f x))");
        assert_round_trip("seven IS { LOCAL t; t := 7; t }");
    }

    #[test]
    fn casing_is_canonical_by_role() {
        let mut interp = Interpreter::new(HeapLimits::default());
        let tree = parse_src(&mut interp, "myvar := tally [1]");
        let text = deparse_to_text(&interp, tree, DESCAN_WIDTH);
        assert!(text.contains("Myvar"), "{text}");
        assert!(text.contains("tally"), "{text}");
        assert!(text.contains(":="), "{text}");
    }

    #[test]
    fn long_lines_wrap_at_the_width_bound() {
        let mut interp = Interpreter::new(HeapLimits::default());
        let src = "total := 1 + 2 + 3 + 4 + 5 + 6 + 7 + 8 + 9 + 10 + 11 + 12 + 13";
        let tree = parse_src(&mut interp, src);
        let lines = descan(&deparse(&interp, tree), 24);
        assert!(lines.len() > 1, "wrapping expected");
        assert!(lines.iter().all(|line| line.len() <= 24 + INDENT_AMOUNT), "{lines:?}");
    }
}

fn capitalized(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn case_by_role(name: &str, role: Role) -> String {
    match role {
        Role::Reserved | Role::Trans => name.to_uppercase(),
        Role::Optn => name.to_lowercase(),
        Role::Var | Role::Expr => capitalized(name),
        Role::Ident | Role::Constant => capitalized(name),
    }
}

/// Renders a deparsed token stream into lines bounded by `width`, honoring
/// the formatting tokens and wrapping long lines at token boundaries.
pub(crate) fn descan(stream: &TokenStream, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut indent = 0usize;
    let mut pending_indent = 0usize;

    let flush = |line: &mut String, lines: &mut Vec<String>| {
        if !line.trim_end().is_empty() {
            lines.push(line.trim_end().to_owned());
        }
        line.clear();
    };

    for token in &stream.tokens {
        match token.prop {
            TokenProp::Eol => {
                flush(&mut line, &mut lines);
                pending_indent = indent;
            }
            TokenProp::Indent => indent += INDENT_AMOUNT,
            TokenProp::Exdent => indent = indent.saturating_sub(INDENT_AMOUNT),
            TokenProp::Comment => {
                // A long comment wraps onto continuation lines of its own.
                if !line.is_empty() {
                    flush(&mut line, &mut lines);
                    pending_indent = indent;
                }
                let mut text = token.text.as_str();
                let mut extra = 0usize;
                loop {
                    let room = width.saturating_sub(pending_indent + extra);
                    if text.chars().count() <= room || room < width / 2 {
                        break;
                    }
                    // Split at the last blank that fits, on a char boundary.
                    let limit = text.char_indices().nth(room).map_or(text.len(), |(i, _)| i);
                    let split = match text[..limit].rfind(' ') {
                        Some(at) if at > 0 => at,
                        _ => break,
                    };
                    lines.push(format!("{}{}", " ".repeat(pending_indent + extra), &text[..split]));
                    text = text[split..].trim_start();
                    extra = COMMENT_INDENT;
                }
                lines.push(format!("{}{}", " ".repeat(pending_indent + extra), text));
                pending_indent = indent;
            }
            _ => {
                if line.is_empty() {
                    line.push_str(&" ".repeat(pending_indent));
                } else if line.len() + 1 + token.text.len() > width {
                    flush(&mut line, &mut lines);
                    line.push_str(&" ".repeat(indent + INDENT_AMOUNT));
                } else {
                    line.push(' ');
                }
                line.push_str(&token.text);
            }
        }
    }
    flush(&mut line, &mut lines);
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}
