use std::fmt::Write as _;

use crate::encoding::Encoding;
use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

/// Print an SmtTerm as SMT-LIB2 format.
pub fn to_smtlib(term: &SmtTerm) -> String {
    let mut out = String::new();
    write_term(&mut out, term);
    out
}

fn write_binary(out: &mut String, op: &str, lhs: &SmtTerm, rhs: &SmtTerm) {
    out.push('(');
    out.push_str(op);
    out.push(' ');
    write_term(out, lhs);
    out.push(' ');
    write_term(out, rhs);
    out.push(')');
}

fn write_nary(out: &mut String, op: &str, empty: &str, terms: &[SmtTerm]) {
    match terms {
        [] => out.push_str(empty),
        [single] => write_term(out, single),
        _ => {
            out.push('(');
            out.push_str(op);
            for t in terms {
                out.push(' ');
                write_term(out, t);
            }
            out.push(')');
        }
    }
}

fn write_term(out: &mut String, term: &SmtTerm) {
    match term {
        SmtTerm::Var(name) => out.push_str(&quote_symbol(name)),
        SmtTerm::IntLit(n) => {
            if *n < 0 {
                let _ = write!(out, "(- {})", n.unsigned_abs());
            } else {
                let _ = write!(out, "{n}");
            }
        }
        SmtTerm::BoolLit(b) => out.push_str(if *b { "true" } else { "false" }),
        SmtTerm::Add(lhs, rhs) => write_binary(out, "+", lhs, rhs),
        SmtTerm::Sub(lhs, rhs) => write_binary(out, "-", lhs, rhs),
        SmtTerm::Eq(lhs, rhs) => write_binary(out, "=", lhs, rhs),
        SmtTerm::Lt(lhs, rhs) => write_binary(out, "<", lhs, rhs),
        SmtTerm::Le(lhs, rhs) => write_binary(out, "<=", lhs, rhs),
        SmtTerm::Gt(lhs, rhs) => write_binary(out, ">", lhs, rhs),
        SmtTerm::Ge(lhs, rhs) => write_binary(out, ">=", lhs, rhs),
        SmtTerm::And(terms) => write_nary(out, "and", "true", terms),
        SmtTerm::Or(terms) => write_nary(out, "or", "false", terms),
        SmtTerm::Not(inner) => {
            out.push_str("(not ");
            write_term(out, inner);
            out.push(')');
        }
        SmtTerm::Implies(lhs, rhs) => write_binary(out, "=>", lhs, rhs),
        SmtTerm::Ite(cond, then, els) => {
            out.push_str("(ite ");
            write_term(out, cond);
            out.push(' ');
            write_term(out, then);
            out.push(' ');
            write_term(out, els);
            out.push(')');
        }
    }
}

/// Variable names carry router and interface names, which may contain
/// characters outside the SMT-LIB simple-symbol alphabet.
fn quote_symbol(name: &str) -> String {
    let simple = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "~!@$%^&*_-+=<>.?/".contains(c));
    if simple {
        name.to_string()
    } else {
        format!("|{}|", name.replace('|', "_"))
    }
}

/// Print a sort as SMT-LIB2 format.
pub fn sort_to_smtlib(sort: SmtSort) -> &'static str {
    match sort {
        SmtSort::Bool => "Bool",
        SmtSort::Int => "Int",
    }
}

/// Render a whole encoding as an SMT-LIB2 script ending in `(check-sat)`.
pub fn encoding_to_script(encoding: &Encoding) -> String {
    let mut out = String::from("(set-logic QF_LIA)\n");
    for (name, sort) in &encoding.declarations {
        let _ = writeln!(
            out,
            "(declare-const {} {})",
            quote_symbol(name),
            sort_to_smtlib(*sort)
        );
    }
    for term in &encoding.assertions {
        let _ = writeln!(out, "(assert {})", to_smtlib(term));
    }
    out.push_str("(check-sat)\n");
    out
}
