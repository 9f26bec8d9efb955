// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The textual form of code objects.
//!
//! The compiler proper is an external collaborator; the host consumes this
//! line-based assembly instead. A program is a sequence of `fn` blocks:
//!
//! ```text
//! fn adder arity=2
//!   ldlc 0
//!   ldlc 1
//!   add
//!   ret
//! end
//!
//! fn main
//!   ldgbl print
//!   const.i 40
//!   const.i 2
//!   ldgbl adder      ; or const.code adder + call through a local
//!   ...
//! end
//! ```
//!
//! Literals are spelled with `const.*` pseudo-instructions, jump targets are
//! `name:` labels, and `const.code NAME` pushes another block's code object
//! (for `mkfn`). Execution starts at `fn main`.

use std::collections::HashMap;

use anyhow::{Context as _, anyhow, bail};
use arvm::object::function::FunctionFlags;
use arvm::object::{boolean, bytes, float, integer, nil, string};
use arvm::{AttributeFlags, CallMode, Code, CodeBuilder, OpCode};
use std::sync::Arc;

struct Block {
    name: String,
    arity: usize,
    locals: usize,
    lines: Vec<(usize, Vec<Token>)>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
}

impl Token {
    fn word(&self) -> Option<&str> {
        match self {
            Token::Word(w) => Some(w),
            Token::Str(_) => None,
        }
    }
}

/// Assemble a whole program, returning the code object of `fn main`.
pub fn assemble(source: &str) -> anyhow::Result<Arc<Code>> {
    let blocks = parse_blocks(source)?;

    let mut assembled: HashMap<String, Arc<Code>> = HashMap::new();
    let mut in_progress = Vec::new();

    fn resolve(
        name: &str,
        blocks: &HashMap<String, Block>,
        assembled: &mut HashMap<String, Arc<Code>>,
        in_progress: &mut Vec<String>,
    ) -> anyhow::Result<Arc<Code>> {
        if let Some(code) = assembled.get(name) {
            return Ok(Arc::clone(code));
        }

        if in_progress.iter().any(|n| n == name) {
            bail!("recursive const.code reference through '{name}' (use ldgbl for recursion)");
        }

        let block = blocks
            .get(name)
            .ok_or_else(|| anyhow!("unknown function '{name}'"))?;

        in_progress.push(name.to_string());
        let code = assemble_block(block, &mut |inner| {
            resolve(inner, blocks, assembled, in_progress)
        })?;
        in_progress.pop();

        assembled.insert(name.to_string(), Arc::clone(&code));
        Ok(code)
    }

    let names: Vec<String> = blocks.keys().cloned().collect();
    for name in &names {
        resolve(name, &blocks, &mut assembled, &mut in_progress)?;
    }

    assembled
        .get("main")
        .cloned()
        .ok_or_else(|| anyhow!("program has no 'fn main'"))
}

/// Assemble a single block, with access to every other block's code object.
fn assemble_block(
    block: &Block,
    resolve_code: &mut dyn FnMut(&str) -> anyhow::Result<Arc<Code>>,
) -> anyhow::Result<Arc<Code>> {
    let mut b = CodeBuilder::new(block.name.clone());
    b.locals(block.locals.max(block.arity));

    // first pass: collect label names
    let mut labels = HashMap::new();
    for (_, tokens) in &block.lines {
        if let [Token::Word(w)] = tokens.as_slice()
            && let Some(label) = w.strip_suffix(':')
        {
            labels.insert(label.to_string(), b.label());
        }
    }

    for (line_no, tokens) in &block.lines {
        b.line(u32::try_from(*line_no).unwrap_or(0));
        emit_line(&mut b, tokens, &labels, resolve_code)
            .with_context(|| format!("line {line_no} of fn '{}'", block.name))?;
    }

    Ok(b.build())
}

fn emit_line(
    b: &mut CodeBuilder,
    tokens: &[Token],
    labels: &HashMap<String, arvm::object::code::Label>,
    resolve_code: &mut dyn FnMut(&str) -> anyhow::Result<Arc<Code>>,
) -> anyhow::Result<()> {
    let Some(first) = tokens.first() else {
        return Ok(());
    };

    let Some(head) = first.word() else {
        bail!("instruction expected, found string literal");
    };

    // label binding
    if let Some(label) = head.strip_suffix(':') {
        let label = labels
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("unknown label '{label}'"))?;
        b.bind(label);
        return Ok(());
    }

    // literal pseudo-instructions
    if let Some(kind) = head.strip_prefix("const.") {
        let obj = match (kind, tokens.get(1)) {
            ("nil", None) => nil::nil(),
            ("true", None) => boolean::boolean(true),
            ("false", None) => boolean::boolean(false),
            ("i", Some(tok)) => {
                let w = tok.word().ok_or_else(|| anyhow!("const.i expects an integer"))?;
                integer::integer(w.parse().context("invalid integer literal")?)
            }
            ("f", Some(tok)) => {
                let w = tok.word().ok_or_else(|| anyhow!("const.f expects a float"))?;
                float::float(w.parse().context("invalid float literal")?)
            }
            ("s", Some(Token::Str(s))) => string::string(s.clone()),
            ("b", Some(Token::Str(s))) => bytes::bytes(s.clone().into_bytes()),
            ("code", Some(tok)) => {
                let name = tok.word().ok_or_else(|| anyhow!("const.code expects a name"))?;
                let code = resolve_code(name)?;
                code.into_object()
            }
            _ => bail!("malformed const.{kind}"),
        };

        let idx = b.static_ref(obj);
        b.op_wide(OpCode::LStatic, idx);
        return Ok(());
    }

    let op = OpCode::from_mnemonic(head).ok_or_else(|| anyhow!("unknown opcode '{head}'"))?;

    match op {
        // name-table instructions
        OpCode::LdGbl | OpCode::StGbl => {
            let name = operand_word(tokens, 1, "a global name")?;
            let idx = b.name_ref(name);
            b.op_wide(op, idx);
        }
        OpCode::Ngv => {
            let name = operand_word(tokens, 1, "a global name")?;
            let idx = b.name_ref(name);
            let mut flags = AttributeFlags::empty();
            for tok in &tokens[2..] {
                match tok.word() {
                    Some("pub") => flags |= AttributeFlags::PUBLIC,
                    Some("const") => flags |= AttributeFlags::CONST,
                    _ => bail!("unknown ngv flag"),
                }
            }
            b.op_flags(op, u16::try_from(idx).context("name table overflow")?, flags_low(flags));
        }

        // statics-keyed instructions
        OpCode::LdAttr
        | OpCode::LdScope
        | OpCode::LdMeth
        | OpCode::StAttr
        | OpCode::StScope
        | OpCode::ImpMod
        | OpCode::ImpFrm => {
            let key = match tokens.get(1) {
                Some(Token::Str(s)) => s.clone(),
                Some(Token::Word(w)) => w.clone(),
                None => bail!("{} expects a key", op.mnemonic()),
            };
            let idx = b.static_ref(string::string(key));
            b.op_wide(op, idx);
        }

        // jumps
        OpCode::Jmp
        | OpCode::Jt
        | OpCode::Jf
        | OpCode::Jtop
        | OpCode::Jfop
        | OpCode::Jnil
        | OpCode::Jnn
        | OpCode::Jex
        | OpCode::St => {
            let target = operand_word(tokens, 1, "a label")?;
            let label = labels
                .get(target)
                .copied()
                .ok_or_else(|| anyhow!("unknown label '{target}'"))?;
            b.jump(op, label);
        }
        OpCode::Trap => match tokens.get(1).and_then(Token::word) {
            // a bare `trap` disarms: target offset zero
            None => {
                b.op_wide(op, 0);
            }
            Some(target) => {
                let label = labels
                    .get(target)
                    .copied()
                    .ok_or_else(|| anyhow!("unknown label '{target}'"))?;
                b.jump(op, label);
            }
        },

        // calls
        OpCode::Call | OpCode::Dfr | OpCode::Spw => {
            let size: u16 = operand_word(tokens, 1, "an argument count")?
                .parse()
                .context("invalid argument count")?;
            let mut mode = CallMode::empty();
            for tok in &tokens[2..] {
                match tok.word() {
                    Some("kw") => mode |= CallMode::KW_PARAMS,
                    Some("rest") => mode |= CallMode::REST_PARAMS,
                    _ => bail!("unknown call mode"),
                }
            }
            b.op_flags(op, size, mode.bits());
        }

        // comparisons
        OpCode::Cmp | OpCode::EqSt => {
            let mode = match operand_word(tokens, 1, "a compare mode")? {
                "eq" => 0,
                "ne" => 1,
                "lt" => 2,
                "le" => 3,
                "gt" => 4,
                "ge" => 5,
                other => bail!("unknown compare mode '{other}'"),
            };
            b.op_arg(op, mode);
        }
        OpCode::Cnt => {
            let mode = match operand_word(tokens, 1, "in or not_in")? {
                "in" => 0,
                "not_in" => 1,
                other => bail!("unknown containment mode '{other}'"),
            };
            b.op_arg(op, mode);
        }

        // function construction
        OpCode::MkFn => {
            let arity: u16 = operand_word(tokens, 1, "an arity")?
                .parse()
                .context("invalid arity")?;
            let mut flags = FunctionFlags::empty();
            for tok in &tokens[2..] {
                flags |= match tok.word() {
                    Some("method") => FunctionFlags::METHOD,
                    Some("variadic") => FunctionFlags::VARIADIC,
                    Some("kwargs") => FunctionFlags::KWARGS,
                    Some("generator") => FunctionFlags::GENERATOR,
                    Some("async") => FunctionFlags::ASYNC,
                    Some("static") => FunctionFlags::STATIC,
                    Some("closure") => FunctionFlags::CLOSURE,
                    Some("defaults") => FunctionFlags::HAVE_DEFAULTS,
                    _ => bail!("unknown function flag"),
                };
            }
            b.op_flags(op, arity, flags.bits());
        }

        OpCode::Init => {
            let n: u16 = operand_word(tokens, 1, "a field count")?
                .parse()
                .context("invalid field count")?;
            let kw = tokens.get(2).and_then(Token::word) == Some("kw");
            b.op_flags(op, n, u8::from(kw));
        }

        OpCode::TStore => {
            let mut flags = AttributeFlags::empty();
            for tok in &tokens[1..] {
                match tok.word() {
                    Some("pub") => flags |= AttributeFlags::PUBLIC,
                    Some("const") => flags |= AttributeFlags::CONST,
                    Some("static") => flags |= AttributeFlags::STATIC,
                    _ => bail!("unknown tstore flag"),
                }
            }
            b.op_arg(op, flags_low(flags));
        }

        // short numeric operands
        OpCode::LdLc
        | OpCode::StLc
        | OpCode::LdEnc
        | OpCode::StEnc
        | OpCode::Dup
        | OpCode::Mth
        | OpCode::PbHead
        | OpCode::PopGt
        | OpCode::Unpack => {
            let arg: u8 = operand_word(tokens, 1, "a slot index")?
                .parse()
                .context("invalid operand")?;
            b.op_arg(op, arg);
        }

        // wide numeric operands
        OpCode::MkLt | OpCode::MkTp | OpCode::MkSt | OpCode::MkDt | OpCode::MkStruct
        | OpCode::MkTrait | OpCode::LStatic => {
            let arg: u32 = operand_word(tokens, 1, "a count")?
                .parse()
                .context("invalid operand")?;
            b.op_wide(op, arg);
        }

        // bare single-byte instructions
        _ => {
            if tokens.len() > 1 {
                bail!("{} takes no operand", op.mnemonic());
            }
            b.op(op);
        }
    }

    Ok(())
}

fn flags_low(flags: AttributeFlags) -> u8 {
    u8::try_from(flags.bits() & 0xff).unwrap_or(0)
}

fn operand_word<'t>(tokens: &'t [Token], idx: usize, what: &str) -> anyhow::Result<&'t str> {
    tokens
        .get(idx)
        .and_then(Token::word)
        .ok_or_else(|| anyhow!("expected {what}"))
}

fn parse_blocks(source: &str) -> anyhow::Result<HashMap<String, Block>> {
    let mut blocks = HashMap::new();
    let mut current: Option<Block> = None;

    for (line_no, raw) in source.lines().enumerate() {
        let line_no = line_no + 1;
        let tokens = tokenize(raw).with_context(|| format!("line {line_no}"))?;

        let Some(head) = tokens.first().and_then(Token::word) else {
            continue;
        };

        match head {
            "fn" => {
                if current.is_some() {
                    bail!("line {line_no}: nested 'fn' (missing 'end'?)");
                }

                let name = tokens
                    .get(1)
                    .and_then(Token::word)
                    .ok_or_else(|| anyhow!("line {line_no}: 'fn' expects a name"))?
                    .to_string();

                let mut arity = 0;
                let mut locals = 0;
                for tok in &tokens[2..] {
                    let Some(word) = tok.word() else {
                        bail!("line {line_no}: malformed fn attribute");
                    };
                    if let Some(v) = word.strip_prefix("arity=") {
                        arity = v.parse().context("invalid arity")?;
                    } else if let Some(v) = word.strip_prefix("locals=") {
                        locals = v.parse().context("invalid locals count")?;
                    } else {
                        bail!("line {line_no}: unknown fn attribute '{word}'");
                    }
                }

                current = Some(Block {
                    name,
                    arity,
                    locals,
                    lines: Vec::new(),
                });
            }
            "end" => {
                let block = current
                    .take()
                    .ok_or_else(|| anyhow!("line {line_no}: 'end' outside of a fn"))?;
                if blocks.contains_key(&block.name) {
                    bail!("line {line_no}: duplicate fn '{}'", block.name);
                }
                blocks.insert(block.name.clone(), block);
            }
            _ => {
                let Some(block) = current.as_mut() else {
                    bail!("line {line_no}: instruction outside of a fn block");
                };
                block.lines.push((line_no, tokens));
            }
        }
    }

    if let Some(block) = current {
        bail!("fn '{}' is missing its 'end'", block.name);
    }

    Ok(blocks)
}

fn tokenize(line: &str) -> anyhow::Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ';' => break,
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut out = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => out.push('\n'),
                            Some('t') => out.push('\t'),
                            Some('\\') => out.push('\\'),
                            Some('"') => out.push('"'),
                            other => bail!("invalid escape {other:?}"),
                        },
                        Some(c) => out.push(c),
                        None => bail!("unterminated string literal"),
                    }
                }
                tokens.push(Token::Str(out));
            }
            _ => {
                let mut out = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == ';' {
                        break;
                    }
                    out.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(out));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_a_minimal_program() {
        let code = assemble(
            r#"
            fn main
              const.i 40
              const.i 2
              add
              ret
            end
            "#,
        )
        .unwrap();

        assert_eq!(code.qname, "main");
        assert!(code.max_stack >= 2);
    }

    #[test]
    fn rejects_unknown_opcodes() {
        let err = assemble("fn main\n  frobnicate\nend").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn labels_resolve_forward() {
        let code = assemble(
            r#"
            fn main
              const.true
              jt done
              const.i 1
              pop
            done:
              const.i 2
              ret
            end
            "#,
        )
        .unwrap();

        assert!(!code.instr.is_empty());
    }
}
