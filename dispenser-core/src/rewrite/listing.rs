use thiserror::Error;

use super::il::{FieldRef, Instruction, MethodRef, OpCode, Operand};

/// Errors that can occur while assembling a textual method listing.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("unknown opcode '{opcode}' on line {line}")]
    UnknownOpcode { line: usize, opcode: String },

    #[error("wrong argument count for {opcode} on line {line}: expected {expected}, got {got}")]
    WrongArgCount {
        line: usize,
        opcode: String,
        expected: usize,
        got: usize,
    },

    #[error("failed to parse integer '{token}' on line {line}")]
    ParseInt {
        line: usize,
        token: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("malformed reference '{token}' on line {line}")]
    BadReference { line: usize, token: String },
}

fn parse_int(line: usize, token: &str) -> Result<i64, ListingError> {
    let res = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        token.parse::<i64>()
    };

    res.map_err(|e| ListingError::ParseInt {
        line,
        token: token.to_string(),
        source: e,
    })
}

fn parse_slot(line: usize, token: &str) -> Result<u16, ListingError> {
    let t = token.trim_end_matches(',');
    let res = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        t.parse::<u16>()
    };

    res.map_err(|e| ListingError::ParseInt {
        line,
        token: t.to_string(),
        source: e,
    })
}

fn parse_field(line: usize, token: &str) -> Result<FieldRef, ListingError> {
    FieldRef::parse(token).ok_or_else(|| ListingError::BadReference {
        line,
        token: token.to_string(),
    })
}

/// `[instance] Owner:name/params [-> value]`
fn parse_method(line: usize, args: &[&str]) -> Result<MethodRef, ListingError> {
    let bad = |token: &str| ListingError::BadReference {
        line,
        token: token.to_string(),
    };

    let (instance, rest) = match args.first() {
        Some(&"instance") => (true, &args[1..]),
        _ => (false, args),
    };
    let (path, returns) = match rest {
        [path] => (*path, false),
        [path, "->", "value"] => (*path, true),
        _ => return Err(bad(&args.join(" "))),
    };

    let (target, params) = path.rsplit_once('/').ok_or_else(|| bad(path))?;
    let field = FieldRef::parse(target).ok_or_else(|| bad(path))?;
    let params = params.parse::<u8>().map_err(|_| bad(path))?;

    Ok(MethodRef {
        owner: field.owner,
        name: field.name,
        params,
        instance,
        returns,
    })
}

fn expect_args(line: usize, opcode: &str, args: &[&str], expected: usize) -> Result<(), ListingError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ListingError::WrongArgCount {
            line,
            opcode: opcode.to_string(),
            expected,
            got: args.len(),
        })
    }
}

/// Assemble a method listing, one instruction per line.
///
/// Line format (case-insensitive mnemonics; decimal or 0x-prefixed hex numbers):
///
/// - `nop`, `ldnull`, `dup`, `pop`, `mul`, `ret`
/// - `ldarg N`, `ldloc N`, `stloc N`
/// - `ldc N`
/// - `ldsfld Owner:field`, `ldfld Owner:field`, `stfld Owner:field`
/// - `call [instance] Owner:method/params [-> value]`
///
/// Blank lines and lines starting with `#` or `//` are ignored.
pub fn parse_listing(src: &str) -> Result<Vec<Instruction>, ListingError> {
    let mut out = Vec::new();

    for (idx, raw_line) in src.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        let mut parts = line.split_whitespace();
        let mnemonic = match parts.next() {
            Some(tok) => tok.to_ascii_lowercase(),
            None => continue,
        };
        let args: Vec<&str> = parts.collect();

        let opcode = OpCode::from_mnemonic(&mnemonic).ok_or_else(|| ListingError::UnknownOpcode {
            line: line_no,
            opcode: mnemonic.clone(),
        })?;

        let operand = match opcode {
            OpCode::Nop
            | OpCode::LoadNull
            | OpCode::Dup
            | OpCode::Pop
            | OpCode::Mul
            | OpCode::Ret => {
                expect_args(line_no, &mnemonic, &args, 0)?;
                Operand::None
            }
            OpCode::LoadArg | OpCode::LoadLocal | OpCode::StoreLocal => {
                expect_args(line_no, &mnemonic, &args, 1)?;
                Operand::Slot(parse_slot(line_no, args[0])?)
            }
            OpCode::LoadInt => {
                expect_args(line_no, &mnemonic, &args, 1)?;
                Operand::Int(parse_int(line_no, args[0])?)
            }
            OpCode::LoadStaticField | OpCode::LoadField | OpCode::StoreField => {
                expect_args(line_no, &mnemonic, &args, 1)?;
                Operand::Field(parse_field(line_no, args[0])?)
            }
            OpCode::Call => Operand::Method(parse_method(line_no, &args)?),
        };

        out.push(Instruction::new(opcode, operand));
    }

    Ok(out)
}

/// Inverse of [`parse_listing`].
pub fn format_listing(body: &[Instruction]) -> String {
    let mut out = String::new();
    for ins in body {
        out.push_str(&ins.to_string());
        out.push('\n');
    }
    out
}
