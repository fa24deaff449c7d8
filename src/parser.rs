//! Model description parser.
//!
//! Parses the line-oriented model format into the IR.
//!
//! # Supported syntax
//!
//! ```text
//! # comment line
//! host <rank> [threads=<n>]
//! cell <gid> [thread=<t>]
//! node <k> [parent=<p>|-] [d=..] [rhs=..] [a=..] [b=..] [area=..] [v=..]
//! split <k> sid=<n> [style=long|short|reduced]
//! end
//! ```
//!
//! `node` and `split` lines belong to the most recent `cell`, which belongs
//! to the most recent `host`. Nodes of a cell are numbered from 0 in order
//! and a node's parent must precede it. Values support engineering
//! suffixes: T, G, MEG, K, M, U, N, P, F (case-insensitive).

use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_while1};
use nom::character::complete::{char, space0, space1};
use nom::combinator::{all_consuming, map, opt};
use nom::multi::many0;
use nom::number::complete::double;
use nom::sequence::{preceded, separated_pair, terminated};
use nom::IResult;
use nom::Parser;

use crate::error::{MultisplitError, Result};
use crate::ir::{HostSpec, Model, NodeSpec, PieceSpec, SplitSpec};
use crate::solver::registry::{BackboneStyle, Sid};

/// Parse a model description into the IR.
pub fn parse(input: &str) -> Result<Model> {
    let mut model = Model::default();

    for (line_num, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();

        // Skip blank lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.eq_ignore_ascii_case("end") {
            break;
        }

        let (keyword, arg, pairs) = directive(line).map_err(|e| parse_err(line_num, raw_line, &e))?;
        let apply = match keyword.to_ascii_lowercase().as_str() {
            "host" => host_line(&mut model, arg, &pairs),
            "cell" => cell_line(&mut model, arg, &pairs),
            "node" => node_line(&mut model, arg, &pairs),
            "split" => split_line(&mut model, arg, &pairs),
            _ => Err(format!("unknown directive '{}'", keyword)),
        };
        apply.map_err(|e| parse_err(line_num, raw_line, &e))?;
    }

    if model.hosts.is_empty() {
        return Err(MultisplitError::Parse("model declares no hosts".into()));
    }
    Ok(model)
}

fn parse_err(line_num: usize, raw_line: &str, detail: &str) -> MultisplitError {
    MultisplitError::Parse(format!("line {}: {} in: {}", line_num + 1, detail, raw_line))
}

// ---------------------------------------------------------------------------
// Engineering suffix value parser
// ---------------------------------------------------------------------------

/// Parse a numeric value with optional engineering suffix.
/// Handles: 10k, 100n, 4.7u, 1MEG, 1e3, -3.3, etc.
fn eng_value(input: &str) -> IResult<&str, f64> {
    let (rest, num) = double(input)?;
    let (rest, suffix) = opt(eng_suffix).parse(rest)?;
    let multiplier = suffix.unwrap_or(1.0);
    Ok((rest, num * multiplier))
}

/// Match an engineering suffix and return its multiplier.
fn eng_suffix(input: &str) -> IResult<&str, f64> {
    // Order matters: MEG must come before M
    alt((
        map(tag_no_case("MEG"), |_: &str| 1e6),
        map(tag_no_case("T"), |_: &str| 1e12),
        map(tag_no_case("G"), |_: &str| 1e9),
        map(tag_no_case("K"), |_: &str| 1e3),
        map(tag_no_case("M"), |_: &str| 1e-3),
        map(tag_no_case("U"), |_: &str| 1e-6),
        map(tag_no_case("N"), |_: &str| 1e-9),
        map(tag_no_case("P"), |_: &str| 1e-12),
        map(tag_no_case("F"), |_: &str| 1e-15),
    ))
    .parse(input)
}

// ---------------------------------------------------------------------------
// Token parsers
// ---------------------------------------------------------------------------

fn word(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != '=')(input)
}

fn key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn key_value(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(key, char('='), take_while1(|c: char| !c.is_whitespace())).parse(input)
}

/// Split a line into `keyword arg key=value...`.
fn directive(line: &str) -> std::result::Result<(&str, &str, Vec<(&str, &str)>), String> {
    let (_, (keyword, _, arg, pairs)) = all_consuming(terminated(
        (word, space1, word, many0(preceded(space1, key_value))),
        space0,
    ))
    .parse(line)
    .map_err(|_| "expected '<directive> <id> [key=value ...]'".to_string())?;
    Ok((keyword, arg, pairs))
}

fn number(key: &str, text: &str) -> std::result::Result<f64, String> {
    all_consuming(eng_value)
        .parse(text)
        .map(|(_, v)| v)
        .map_err(|_| format!("invalid value '{}' for {}", text, key))
}

fn index(key: &str, text: &str) -> std::result::Result<usize, String> {
    text.parse::<usize>()
        .map_err(|_| format!("invalid index '{}' for {}", text, key))
}

fn unknown_key(directive: &str, key: &str) -> String {
    format!("unknown {} parameter '{}'", directive, key)
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

fn host_line(model: &mut Model, arg: &str, pairs: &[(&str, &str)]) -> std::result::Result<(), String> {
    let rank = index("host", arg)?;
    if rank != model.hosts.len() {
        return Err(format!("expected host {}, found host {}", model.hosts.len(), rank));
    }
    let mut host = HostSpec::default();
    for &(k, v) in pairs {
        match k.to_ascii_lowercase().as_str() {
            "threads" => host.threads = index(k, v)?,
            _ => return Err(unknown_key("host", k)),
        }
    }
    if host.threads == 0 {
        return Err("a host needs at least one thread".into());
    }
    model.hosts.push(host);
    Ok(())
}

fn cell_line(model: &mut Model, arg: &str, pairs: &[(&str, &str)]) -> std::result::Result<(), String> {
    let cell = index("cell", arg)?;
    let host = model.hosts.last_mut().ok_or("cell before any host")?;
    let mut thread = 0;
    for &(k, v) in pairs {
        match k.to_ascii_lowercase().as_str() {
            "thread" => thread = index(k, v)?,
            _ => return Err(unknown_key("cell", k)),
        }
    }
    if thread >= host.threads {
        return Err(format!("thread {} exceeds the host's {} threads", thread, host.threads));
    }
    host.pieces.push(PieceSpec {
        cell,
        thread,
        nodes: Vec::new(),
        splits: Vec::new(),
    });
    Ok(())
}

fn current_piece(model: &mut Model) -> std::result::Result<&mut PieceSpec, String> {
    model
        .hosts
        .last_mut()
        .and_then(|h| h.pieces.last_mut())
        .ok_or_else(|| "node or split before any cell".to_string())
}

fn node_line(model: &mut Model, arg: &str, pairs: &[(&str, &str)]) -> std::result::Result<(), String> {
    let k = index("node", arg)?;
    let piece = current_piece(model)?;
    if k != piece.nodes.len() {
        return Err(format!("expected node {}, found node {}", piece.nodes.len(), k));
    }
    let mut node = NodeSpec::default();
    for &(key, v) in pairs {
        match key.to_ascii_lowercase().as_str() {
            "parent" if v == "-" => node.parent = None,
            "parent" => {
                let p = index(key, v)?;
                if p >= k {
                    return Err(format!("parent {} does not precede node {}", p, k));
                }
                node.parent = Some(p);
            }
            "d" => node.d = number(key, v)?,
            "rhs" => node.rhs = number(key, v)?,
            "a" => node.a = number(key, v)?,
            "b" => node.b = number(key, v)?,
            "area" => node.area = number(key, v)?,
            "v" => node.v = number(key, v)?,
            _ => return Err(unknown_key("node", key)),
        }
    }
    piece.nodes.push(node);
    Ok(())
}

fn style(text: &str) -> std::result::Result<BackboneStyle, String> {
    match text.to_ascii_lowercase().as_str() {
        "long" => Ok(BackboneStyle::Long),
        "short" => Ok(BackboneStyle::Short),
        "reduced" => Ok(BackboneStyle::ReducedTree),
        _ => Err(format!("unknown split style '{}'", text)),
    }
}

fn split_line(model: &mut Model, arg: &str, pairs: &[(&str, &str)]) -> std::result::Result<(), String> {
    let node = index("split", arg)?;
    let piece = current_piece(model)?;
    if node >= piece.nodes.len() {
        return Err(format!("split on undeclared node {}", node));
    }
    let mut sid: Option<Sid> = None;
    let mut split_style = BackboneStyle::Long;
    for &(k, v) in pairs {
        match k.to_ascii_lowercase().as_str() {
            "sid" => sid = Some(v.parse::<Sid>().map_err(|_| format!("invalid sid '{}'", v))?),
            "style" => split_style = style(v)?,
            _ => return Err(unknown_key("split", k)),
        }
    }
    let sid = sid.ok_or("split needs sid=<n>")?;
    piece.splits.push(SplitSpec {
        node,
        sid,
        style: split_style,
    });
    Ok(())
}
