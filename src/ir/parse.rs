//! Recursive-descent reader for the IR text form.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use super::lexer::{Lexer, Tok, Token};
use super::*;
use crate::diagnostic::Diagnostic;

/// Parse a module from its text form.
pub fn parse_module(source: &str) -> Result<Module, Diagnostic> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser { tokens, pos: 0 }.module()
}

/// Parse a module from raw bytes, rejecting non-UTF-8 input.
pub fn parse_module_bytes(bytes: &[u8]) -> Result<Module, Diagnostic> {
    let source = std::str::from_utf8(bytes).map_err(|e| {
        let at = e.valid_up_to();
        Diagnostic::error("program IR is not valid UTF-8".to_string(), at..at + 1)
    })?;
    parse_module(source)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type PResult<T> = Result<T, Diagnostic>;

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_at(&self, n: usize) -> &Tok {
        let i = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[i].tok
    }

    fn span(&self) -> Range<usize> {
        self.tokens[self.pos].span.clone()
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error<T>(&self, expected: &str) -> PResult<T> {
        Err(Diagnostic::error(
            format!("expected {}, found {}", expected, self.peek().describe()),
            self.span(),
        ))
    }

    fn expect(&mut self, tok: Tok) -> PResult<()> {
        if *self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            self.error(&tok.describe())
        }
    }

    fn is_word(&self, w: &str) -> bool {
        matches!(self.peek(), Tok::Word(x) if x == w)
    }

    fn eat_word(&mut self, w: &str) -> bool {
        if self.is_word(w) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, w: &str) -> PResult<()> {
        if self.eat_word(w) {
            Ok(())
        } else {
            self.error(&format!("'{}'", w))
        }
    }

    fn string(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Str(s) => {
                self.advance();
                Ok(s)
            }
            _ => self.error("string literal"),
        }
    }

    fn int(&mut self) -> PResult<i64> {
        match self.peek().clone() {
            Tok::Int(v) => {
                self.advance();
                Ok(v)
            }
            _ => self.error("integer"),
        }
    }

    fn local_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Local(n) => {
                self.advance();
                Ok(n)
            }
            _ => self.error("local name"),
        }
    }

    fn global_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Global(n) => {
                self.advance();
                Ok(n)
            }
            _ => self.error("global name"),
        }
    }

    // ─── Module ───────────────────────────────────────────────────

    fn module(&mut self) -> PResult<Module> {
        let mut m = Module::default();
        loop {
            match self.peek().clone() {
                Tok::Eof => return Ok(m),
                Tok::Word(w) if w == "source_filename" => {
                    self.advance();
                    self.expect(Tok::Equals)?;
                    m.name = self.string()?;
                }
                Tok::Word(w) if w == "target" => {
                    self.advance();
                    if self.eat_word("datalayout") {
                        self.expect(Tok::Equals)?;
                        m.data_layout = self.string()?;
                    } else if self.eat_word("triple") {
                        self.expect(Tok::Equals)?;
                        m.triple = self.string()?;
                    } else {
                        return self.error("'datalayout' or 'triple'");
                    }
                }
                Tok::Meta(key) => {
                    self.advance();
                    self.expect(Tok::Equals)?;
                    let value = self.meta_value()?;
                    m.metadata.insert(key, value);
                }
                Tok::Global(_) => {
                    let g = self.global()?;
                    if m.has_symbol(&g.name) {
                        return Err(Diagnostic::error(
                            format!("redefinition of '@{}'", g.name),
                            self.span(),
                        ));
                    }
                    m.globals.push(g);
                }
                Tok::Word(w) if w == "define" || w == "declare" => {
                    let start = self.span();
                    let f = self.function()?;
                    if m.has_symbol(&f.name) {
                        return Err(Diagnostic::error(
                            format!("redefinition of '@{}'", f.name),
                            start,
                        ));
                    }
                    m.functions.push(f);
                }
                _ => return self.error("top-level entity"),
            }
        }
    }

    fn meta_value(&mut self) -> PResult<MetaValue> {
        match self.peek().clone() {
            Tok::Str(s) => {
                self.advance();
                Ok(MetaValue::Str(s))
            }
            Tok::Word(w) if w == "true" || w == "false" => {
                self.advance();
                Ok(MetaValue::Bool(w == "true"))
            }
            Tok::Word(w) if w == "i64" => {
                self.advance();
                let v = self.int()?;
                if v < 0 {
                    return self.error("non-negative metadata integer");
                }
                Ok(MetaValue::Int(v as u64))
            }
            _ => self.error("metadata value"),
        }
    }

    fn global(&mut self) -> PResult<Global> {
        let name = self.global_name()?;
        self.expect(Tok::Equals)?;
        self.expect_word("addrspace")?;
        self.expect(Tok::LParen)?;
        let addr_space = self.int()? as u32;
        self.expect(Tok::RParen)?;
        let constant = if self.eat_word("constant") {
            true
        } else {
            self.expect_word("global")?;
            false
        };
        let ty = self.ty()?;
        self.expect_word("x")?;
        let count = self.int()?;
        if count <= 0 {
            return self.error("positive element count");
        }
        let init = if self.eat_word("external") {
            Init::External
        } else if self.eat_word("zeroinitializer") {
            Init::Zero
        } else {
            self.expect(Tok::LBracket)?;
            let mut vals = Vec::new();
            if *self.peek() != Tok::RBracket {
                loop {
                    vals.push(self.typed_value()?);
                    if *self.peek() == Tok::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
            self.expect(Tok::RBracket)?;
            Init::Values(vals)
        };
        Ok(Global {
            name,
            addr_space,
            constant,
            ty,
            count: count as u64,
            init,
        })
    }

    // ─── Types and values ─────────────────────────────────────────

    fn ty(&mut self) -> PResult<Type> {
        let Tok::Word(w) = self.peek().clone() else {
            return self.error("type");
        };
        let ty = match w.as_str() {
            "void" => Type::Void,
            "i1" => Type::I1,
            "i8" => Type::I8,
            "i16" => Type::I16,
            "i32" => Type::I32,
            "i64" => Type::I64,
            "float" => Type::F32,
            "double" => Type::F64,
            "ptr" => {
                self.advance();
                if self.eat_word("addrspace") {
                    self.expect(Tok::LParen)?;
                    let n = self.int()?;
                    self.expect(Tok::RParen)?;
                    return Ok(Type::Ptr(n as u32));
                }
                return Ok(Type::Ptr(0));
            }
            _ => return self.error("type"),
        };
        self.advance();
        Ok(ty)
    }

    fn value_of(&mut self, ty: Type) -> PResult<Value> {
        let kind = match self.peek().clone() {
            Tok::Local(n) => ValueKind::Local(n),
            Tok::Global(n) => ValueKind::Global(n),
            Tok::Int(v) if ty.is_float() => ValueKind::Float(v as f64),
            Tok::Int(v) => ValueKind::Int(v),
            Tok::Hex(bits) if ty.is_float() => ValueKind::Float(f64::from_bits(bits)),
            Tok::Hex(bits) => ValueKind::Int(bits as i64),
            Tok::Word(w) if w == "null" => ValueKind::Null,
            Tok::Word(w) if w == "undef" => ValueKind::Undef,
            Tok::Word(w) if w == "true" => ValueKind::Int(1),
            Tok::Word(w) if w == "false" => ValueKind::Int(0),
            _ => return self.error("value"),
        };
        self.advance();
        Ok(Value { ty, kind })
    }

    fn typed_value(&mut self) -> PResult<Value> {
        let ty = self.ty()?;
        self.value_of(ty)
    }

    fn label_ref(&mut self) -> PResult<String> {
        self.expect_word("label")?;
        self.local_name()
    }

    // ─── Functions ────────────────────────────────────────────────

    fn function(&mut self) -> PResult<Function> {
        let is_define = self.eat_word("define");
        if !is_define {
            self.expect_word("declare")?;
        }
        let ret = self.ty()?;
        let name = self.global_name()?;
        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        if *self.peek() != Tok::RParen {
            loop {
                let ty = self.ty()?;
                let pname = if let Tok::Local(_) = self.peek() {
                    self.local_name()?
                } else {
                    String::new()
                };
                if is_define && pname.is_empty() {
                    return self.error("parameter name");
                }
                params.push(Param { name: pname, ty });
                if *self.peek() == Tok::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Tok::RParen)?;

        let mut attrs = BTreeSet::new();
        let mut annotations = BTreeMap::new();
        loop {
            match self.peek().clone() {
                Tok::Word(w) => {
                    let attr = match w.as_str() {
                        "kernel" => FnAttr::Kernel,
                        "alwaysinline" => FnAttr::AlwaysInline,
                        "noinline" => FnAttr::NoInline,
                        "optnone" => FnAttr::OptNone,
                        _ => break,
                    };
                    self.advance();
                    attrs.insert(attr);
                }
                Tok::Str(k) => {
                    self.advance();
                    self.expect(Tok::Equals)?;
                    let v = self.string()?;
                    annotations.insert(k, v);
                }
                _ => break,
            }
        }

        let mut f = Function {
            name,
            ret,
            params,
            attrs,
            annotations,
            blocks: Vec::new(),
        };
        if !is_define {
            return Ok(f);
        }

        self.expect(Tok::LBrace)?;
        while *self.peek() != Tok::RBrace {
            f.blocks.push(self.block()?);
        }
        self.expect(Tok::RBrace)?;
        if f.blocks.is_empty() {
            return self.error("at least one basic block");
        }
        Ok(f)
    }

    fn block(&mut self) -> PResult<Block> {
        let label = match self.peek().clone() {
            Tok::Word(w) if *self.peek_at(1) == Tok::Colon => {
                self.advance();
                w
            }
            Tok::Int(v) if *self.peek_at(1) == Tok::Colon => {
                self.advance();
                v.to_string()
            }
            _ => return self.error("block label"),
        };
        self.expect(Tok::Colon)?;
        let mut insts = Vec::new();
        loop {
            if let Some(term) = self.terminator()? {
                return Ok(Block { label, insts, term });
            }
            insts.push(self.inst()?);
        }
    }

    fn terminator(&mut self) -> PResult<Option<Terminator>> {
        if self.eat_word("br") {
            if self.is_word("label") {
                return Ok(Some(Terminator::Br(self.label_ref()?)));
            }
            let cond = self.typed_value()?;
            self.expect(Tok::Comma)?;
            let then_bb = self.label_ref()?;
            self.expect(Tok::Comma)?;
            let else_bb = self.label_ref()?;
            return Ok(Some(Terminator::CondBr {
                cond,
                then_bb,
                else_bb,
            }));
        }
        if self.eat_word("ret") {
            if self.eat_word("void") {
                return Ok(Some(Terminator::Ret(None)));
            }
            return Ok(Some(Terminator::Ret(Some(self.typed_value()?))));
        }
        if self.eat_word("unreachable") {
            return Ok(Some(Terminator::Unreachable));
        }
        Ok(None)
    }

    fn inst(&mut self) -> PResult<Inst> {
        let result = if let Tok::Local(_) = self.peek() {
            let r = self.local_name()?;
            self.expect(Tok::Equals)?;
            Some(r)
        } else {
            None
        };
        let op = self.op()?;
        let inst = Inst { result, op };
        let produces = inst.result_type() != Type::Void;
        if inst.result.is_some() && !produces {
            return self.error("instruction producing a value");
        }
        Ok(inst)
    }

    fn op(&mut self) -> PResult<Op> {
        let Tok::Word(w) = self.peek().clone() else {
            return self.error("instruction");
        };
        self.advance();
        if let Some(op) = BinOp::ALL.iter().find(|o| o.mnemonic() == w) {
            let lhs = self.typed_value()?;
            self.expect(Tok::Comma)?;
            let rhs = self.typed_value()?;
            return Ok(Op::Binary { op: *op, lhs, rhs });
        }
        if let Some(kind) = CastKind::ALL.iter().find(|k| k.mnemonic() == w) {
            let value = self.typed_value()?;
            self.expect_word("to")?;
            let to = self.ty()?;
            return Ok(Op::Cast {
                kind: *kind,
                value,
                to,
            });
        }
        match w.as_str() {
            "alloca" => {
                let ty = self.ty()?;
                self.expect(Tok::Comma)?;
                let count = self.int()?;
                if count <= 0 {
                    return self.error("positive alloca count");
                }
                Ok(Op::Alloca {
                    ty,
                    count: count as u64,
                })
            }
            "load" => {
                let ty = self.ty()?;
                self.expect(Tok::Comma)?;
                let ptr = self.typed_value()?;
                Ok(Op::Load { ty, ptr })
            }
            "store" => {
                let value = self.typed_value()?;
                self.expect(Tok::Comma)?;
                let ptr = self.typed_value()?;
                Ok(Op::Store { value, ptr })
            }
            "icmp" | "fcmp" => {
                let Tok::Word(p) = self.peek().clone() else {
                    return self.error("comparison predicate");
                };
                let Some(pred) = CmpPred::ALL
                    .iter()
                    .find(|c| c.mnemonic() == p && c.is_float() == (w == "fcmp"))
                else {
                    return self.error("comparison predicate");
                };
                self.advance();
                let lhs = self.typed_value()?;
                self.expect(Tok::Comma)?;
                let rhs = self.typed_value()?;
                Ok(Op::Cmp {
                    pred: *pred,
                    lhs,
                    rhs,
                })
            }
            "select" => {
                let cond = self.typed_value()?;
                self.expect(Tok::Comma)?;
                let then_value = self.typed_value()?;
                self.expect(Tok::Comma)?;
                let else_value = self.typed_value()?;
                Ok(Op::Select {
                    cond,
                    then_value,
                    else_value,
                })
            }
            "gep" => {
                let elem = self.ty()?;
                self.expect(Tok::Comma)?;
                let base = self.typed_value()?;
                self.expect(Tok::Comma)?;
                let index = self.typed_value()?;
                Ok(Op::Gep { elem, base, index })
            }
            "call" => {
                let ret = self.ty()?;
                let callee = self.global_name()?;
                self.expect(Tok::LParen)?;
                let mut args = Vec::new();
                if *self.peek() != Tok::RParen {
                    loop {
                        args.push(self.typed_value()?);
                        if *self.peek() == Tok::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Tok::RParen)?;
                Ok(Op::Call { ret, callee, args })
            }
            "phi" => {
                let ty = self.ty()?;
                let mut incoming = Vec::new();
                loop {
                    self.expect(Tok::LBracket)?;
                    let v = self.typed_value()?;
                    self.expect(Tok::Comma)?;
                    let bb = self.local_name()?;
                    self.expect(Tok::RBracket)?;
                    incoming.push((v, bb));
                    if *self.peek() == Tok::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                Ok(Op::Phi { ty, incoming })
            }
            _ => Err(Diagnostic::error(
                format!("unknown instruction '{}'", w),
                self.tokens[self.pos - 1].span.clone(),
            )),
        }
    }
}
