//! Parser for the `.tir` text format.

use hashbrown::HashMap;

use crate::core::error::{CompileError, CompileResult};
use crate::core::types::{TypeId, TypeRegistry};
use crate::ir::{BinOp, Conv, IrBlockId, IrBuilder, IrFunc, IrLocalId, NodeId, UnOp};
use crate::ssa::Cond;

/// Parse every function in `text`, registering aggregate types in `types`.
pub fn parse_module(text: &str, types: &mut TypeRegistry) -> CompileResult<Vec<IrFunc>> {
    Parser::new(text, types).parse()
}

struct Parser<'a, 't> {
    text: &'a str,
    pos: usize,
    types: &'t mut TypeRegistry,
    funcs: Vec<IrFunc>,

    // Per-function state
    func_name: String,
    param_count: usize,
    blocks: HashMap<&'a str, IrBlockId>,
    defined: Vec<bool>,
    // Node names are scoped to their block
    values: HashMap<&'a str, NodeId>,
    locals: HashMap<&'a str, IrLocalId>,
}

impl<'a, 't> Parser<'a, 't> {
    fn new(text: &'a str, types: &'t mut TypeRegistry) -> Self {
        Self {
            text,
            pos: 0,
            types,
            funcs: Vec::new(),
            func_name: String::new(),
            param_count: 0,
            blocks: HashMap::new(),
            defined: Vec::new(),
            values: HashMap::new(),
            locals: HashMap::new(),
        }
    }

    fn parse(mut self) -> CompileResult<Vec<IrFunc>> {
        loop {
            self.skip_whitespace(true);
            if self.is_eof() {
                break;
            }
            if self.read_identifier()? != "func" {
                return Err(self.error("expected `func`"));
            }
            let func = self.parse_function()?;
            if self.funcs.iter().any(|f| f.name == func.name) {
                return Err(self.error(format!("duplicate function `{}`", func.name)));
            }
            self.funcs.push(func);
        }
        Ok(self.funcs)
    }

    fn error(&self, reason: impl Into<String>) -> CompileError {
        let line = self.text[..self.pos].matches('\n').count() + 1;
        let func = if self.func_name.is_empty() {
            "<module>".to_string()
        } else {
            self.func_name.clone()
        };
        CompileError::InvalidIr {
            func,
            reason: format!("line {}: {}", line, reason.into()),
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    /// True when only a comment, a newline or the closing brace follows.
    fn at_line_end(&mut self) -> bool {
        self.skip_whitespace(false);
        matches!(self.current_char(), None | Some('\n') | Some('}'))
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace(true);
        self.current_char()
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Like `try_read`, but never looks past the end of the current line.
    fn try_read_on_line(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> CompileResult<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!("expected '{}' but found {:?}", ch, self.current_char())));
        }
        Ok(())
    }

    fn read_name(&mut self) -> CompileResult<&'a str> {
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '$' {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error(format!("expected a name but found {:?}", self.current_char())));
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_identifier(&mut self) -> CompileResult<&'a str> {
        match self.peek() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => self.read_name(),
            found => Err(self.error(format!("expected identifier but found {found:?}"))),
        }
    }

    fn read_value_name(&mut self) -> CompileResult<&'a str> {
        self.expect('%')?;
        self.read_name()
    }

    fn read_symbol(&mut self) -> CompileResult<&'a str> {
        self.expect('@')?;
        self.read_name()
    }

    fn read_integer(&mut self) -> CompileResult<i64> {
        let negative = self.try_read('-');
        self.skip_whitespace(false);
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let digits = self.text[start..self.pos].replace('_', "");
        let parsed = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => digits.parse::<u64>(),
        };
        let magnitude = parsed.map_err(|e| self.error(format!("bad integer `{digits}`: {e}")))?;
        let value = magnitude as i64;
        Ok(if negative { value.wrapping_neg() } else { value })
    }

    fn read_index(&mut self) -> CompileResult<u32> {
        let value = self.read_integer()?;
        u32::try_from(value).map_err(|_| self.error(format!("bad index {value}")))
    }

    fn read_type(&mut self) -> CompileResult<TypeId> {
        if self.try_read('{') {
            let mut fields = Vec::new();
            while !self.try_read('}') {
                if !fields.is_empty() {
                    self.expect(',')?;
                }
                fields.push(self.read_type()?);
            }
            return Ok(self.types.struct_type(&fields));
        }
        let name = self.read_identifier()?;
        TypeRegistry::builtin(name).ok_or_else(|| self.error(format!("unknown type `{name}`")))
    }

    fn parse_function(&mut self) -> CompileResult<IrFunc> {
        self.skip_whitespace(true);
        let name = self.read_name()?;
        self.func_name = name.to_string();
        self.blocks.clear();
        self.defined.clear();
        self.values.clear();
        self.locals.clear();

        self.expect('(')?;
        let mut params = Vec::new();
        while !self.try_read(')') {
            if !params.is_empty() {
                self.expect(',')?;
            }
            params.push(self.read_type()?);
        }
        self.param_count = params.len();
        let result = if self.try_read('-') {
            self.expect('>')?;
            self.read_type()?
        } else {
            TypeId::VOID
        };
        self.expect('{')?;

        let mut b = IrBuilder::new(name, &params, result);
        let mut in_block = false;
        let mut terminated = false;
        loop {
            match self.peek() {
                Some('}') => {
                    self.advance();
                    break;
                }
                None => return Err(self.error("unexpected end of input")),
                Some('%') => {
                    if !in_block || terminated {
                        return Err(self.error("instruction outside a block"));
                    }
                    let dest = self.read_value_name()?;
                    self.expect('=')?;
                    let op = self.read_identifier()?;
                    let node = self.parse_instruction(&mut b, op)?;
                    if self.values.insert(dest, node).is_some() {
                        return Err(self.error(format!("%{dest} defined twice")));
                    }
                }
                Some(_) => {
                    let word = self.read_identifier()?;
                    if word == "local" {
                        let local = self.read_identifier()?;
                        self.expect(':')?;
                        let ty = self.read_type()?;
                        let id = b.local(local, ty);
                        if self.locals.insert(local, id).is_some() {
                            return Err(self.error(format!("local `{local}` declared twice")));
                        }
                    } else if self.current_char() == Some(':') {
                        self.advance();
                        let id = self.block_ref(&mut b, word);
                        if self.defined[id.index()] {
                            return Err(self.error(format!("block `{word}` defined twice")));
                        }
                        self.defined[id.index()] = true;
                        self.values.clear();
                        b.switch_to(id);
                        in_block = true;
                        terminated = false;
                        continue;
                    } else {
                        if !in_block || terminated {
                            return Err(self.error(format!("`{word}` outside a block")));
                        }
                        terminated = self.parse_statement(&mut b, word)?;
                    }
                }
            }
            if !self.at_line_end() {
                return Err(self.error(format!("unexpected {:?}", self.current_char())));
            }
        }

        if self.blocks.is_empty() {
            return Err(self.error("function has no blocks"));
        }
        if let Some((name, _)) = self.blocks.iter().find(|(_, id)| !self.defined[id.index()]) {
            return Err(self.error(format!("jump to undefined block `{name}`")));
        }
        let func = b.finish();
        self.func_name.clear();
        Ok(func)
    }

    /// Look up a block by label, creating it on first mention.
    fn block_ref(&mut self, b: &mut IrBuilder, name: &'a str) -> IrBlockId {
        if let Some(&id) = self.blocks.get(name) {
            return id;
        }
        let id = b.block(name);
        self.blocks.insert(name, id);
        self.defined.push(false);
        id
    }

    fn operand(&mut self) -> CompileResult<NodeId> {
        let name = self.read_value_name()?;
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| self.error(format!("undefined value %{name}")))
    }

    fn local_ref(&mut self) -> CompileResult<IrLocalId> {
        let name = self.read_identifier()?;
        self.locals
            .get(name)
            .copied()
            .ok_or_else(|| self.error(format!("undeclared local `{name}`")))
    }

    /// Parse an unnamed statement; returns true for terminators.
    fn parse_statement(&mut self, b: &mut IrBuilder, word: &'a str) -> CompileResult<bool> {
        match word {
            "jump" => {
                let target = self.read_identifier()?;
                let target = self.block_ref(b, target);
                b.jump(target);
            }
            "br" => {
                let cond = self.operand()?;
                self.expect(',')?;
                let then_block = self.read_identifier()?;
                self.expect(',')?;
                let else_block = self.read_identifier()?;
                let then_block = self.block_ref(b, then_block);
                let else_block = self.block_ref(b, else_block);
                b.branch(cond, then_block, else_block);
            }
            "ret" => {
                let value = if self.at_line_end() {
                    None
                } else {
                    Some(self.operand()?)
                };
                b.ret(value);
            }
            _ => {
                self.parse_instruction(b, word)?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn parse_instruction(&mut self, b: &mut IrBuilder, op: &'a str) -> CompileResult<NodeId> {
        if let Some(bin) = BinOp::parse(op) {
            let lhs = self.operand()?;
            self.expect(',')?;
            let rhs = self.operand()?;
            return Ok(b.binary(bin, lhs, rhs));
        }
        let node = match op {
            "param" => {
                let index = self.read_index()?;
                if index as usize >= self.param_count {
                    return Err(self.error(format!("no parameter {index}")));
                }
                b.param(index)
            }
            "const" => {
                let ty = self.read_type()?;
                let value = self.read_integer()?;
                b.const_int(ty, value)
            }
            "neg" | "not" => {
                let unop = if op == "neg" { UnOp::Neg } else { UnOp::Not };
                let a = self.operand()?;
                b.unary(unop, a)
            }
            "cmp" => {
                let name = self.read_identifier()?;
                let cond = Cond::parse(name).ok_or_else(|| self.error(format!("unknown condition `{name}`")))?;
                let lhs = self.operand()?;
                self.expect(',')?;
                let rhs = self.operand()?;
                b.cmp(cond, lhs, rhs)
            }
            "sext" | "zext" | "trunc" => {
                let conv = match op {
                    "sext" => Conv::SignExt,
                    "zext" => Conv::ZeroExt,
                    _ => Conv::Trunc,
                };
                let ty = self.read_type()?;
                let a = self.operand()?;
                b.convert(conv, ty, a)
            }
            "load.local" => {
                let local = self.local_ref()?;
                b.load_local(local)
            }
            "store.local" => {
                let local = self.local_ref()?;
                self.expect(',')?;
                let value = self.operand()?;
                b.store_local(local, value)
            }
            "addr" => {
                let local = self.local_ref()?;
                b.addr_of(local)
            }
            "load" => {
                let ty = self.read_type()?;
                let ptr = self.operand()?;
                b.load(ty, ptr)
            }
            "store" => {
                let ptr = self.operand()?;
                self.expect(',')?;
                let value = self.operand()?;
                b.store(ptr, value)
            }
            "offset" => {
                let ptr = self.operand()?;
                self.expect(',')?;
                let bytes = self.read_integer()?;
                b.offset(ptr, bytes)
            }
            "global" => {
                let name = self.read_symbol()?;
                b.global(name)
            }
            "call" => self.parse_call(b)?,
            "pair" => {
                let ty = self.read_type()?;
                let mut fields = vec![self.operand()?];
                while self.try_read_on_line(',') {
                    fields.push(self.operand()?);
                }
                b.aggregate(ty, &fields)
            }
            "extract" => {
                let value = self.operand()?;
                self.expect(',')?;
                let index = self.read_index()?;
                b.extract(&*self.types, value, index)
            }
            "zero" => {
                let ptr = self.operand()?;
                self.expect(',')?;
                let ty = self.read_type()?;
                b.zero(ptr, ty)
            }
            "copy" => {
                let a = self.operand()?;
                b.copy(a)
            }
            _ => return Err(self.error(format!("unknown instruction `{op}`"))),
        };
        Ok(node)
    }

    /// `call [ty] @f(%a, ...%b)`; arguments after `...` are variadic.
    fn parse_call(&mut self, b: &mut IrBuilder) -> CompileResult<NodeId> {
        let ty = if self.peek() == Some('@') {
            TypeId::VOID
        } else {
            self.read_type()?
        };
        let callee = self.read_symbol()?;
        self.expect('(')?;
        let mut args = Vec::new();
        let mut fixed = None;
        if !self.try_read(')') {
            loop {
                if self.try_read('.') {
                    self.expect('.')?;
                    self.expect('.')?;
                    if fixed.is_some() {
                        return Err(self.error("`...` given twice"));
                    }
                    fixed = Some(args.len());
                    if self.try_read(')') {
                        break;
                    }
                }
                args.push(self.operand()?);
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }
        let fixed = fixed.unwrap_or(args.len());
        Ok(b.call_variadic(ty, callee, &args, fixed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{NodeKind, Terminator};

    fn parse_one(text: &str) -> (IrFunc, TypeRegistry) {
        let mut types = TypeRegistry::new();
        let mut funcs = parse_module(text, &mut types).unwrap();
        assert_eq!(funcs.len(), 1);
        (funcs.remove(0), types)
    }

    #[test]
    fn test_parse_add() {
        let (func, types) = parse_one(
            "; two parameters\n\
             func add(i64, i64) -> i64 {\n\
             entry:\n\
               %a = param 0\n\
               %b = param 1\n\
               %c = add %a, %b ; sum\n\
               ret %c\n\
             }\n",
        );
        assert_eq!(func.name, "add");
        assert_eq!(func.params, vec![TypeId::I64, TypeId::I64]);
        assert_eq!(func.result, TypeId::I64);
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(func.nodes.len(), 3);
        assert_eq!(func.blocks[0].term, Some(Terminator::Ret(Some(NodeId::new(2)))));
        func.validate(&types).unwrap();
    }

    #[test]
    fn test_loop_matches_builder() {
        let (parsed, types) = parse_one(
            "func count(i64) -> i64 {\n\
               local i: i64\n\
             entry:\n\
               %zero = const i64 0\n\
               store.local i, %zero\n\
               jump header\n\
             header:\n\
               %cur = load.local i\n\
               %n = param 0\n\
               %c = cmp slt %cur, %n\n\
               br %c, body, exit\n\
             body:\n\
               %cur = load.local i\n\
               %one = const i64 1\n\
               %next = add %cur, %one\n\
               store.local i, %next\n\
               jump header\n\
             exit:\n\
               %out = load.local i\n\
               ret %out\n\
             }\n",
        );
        parsed.validate(&types).unwrap();

        let mut b = IrBuilder::new("count", &[TypeId::I64], TypeId::I64);
        let i = b.local("i", TypeId::I64);
        let entry = b.block("entry");
        let header = b.block("header");
        let body = b.block("body");
        let exit = b.block("exit");
        b.switch_to(entry);
        let zero = b.const_int(TypeId::I64, 0);
        b.store_local(i, zero);
        b.jump(header);
        b.switch_to(header);
        let cur = b.load_local(i);
        let n = b.param(0);
        let c = b.cmp(Cond::Slt, cur, n);
        b.branch(c, body, exit);
        b.switch_to(body);
        let cur = b.load_local(i);
        let one = b.const_int(TypeId::I64, 1);
        let next = b.binary(BinOp::Add, cur, one);
        b.store_local(i, next);
        b.jump(header);
        b.switch_to(exit);
        let out = b.load_local(i);
        b.ret(Some(out));

        assert_eq!(parsed, b.finish());
    }

    #[test]
    fn test_aggregates_and_variadic_call() {
        let (func, types) = parse_one(
            "func f(ptr, i32) -> {i64, i32} {\n\
             entry:\n\
               %p = param 0\n\
               %x = param 1\n\
               %n = call i32 @printf(%p, ...%x, %x)\n\
               call @sink()\n\
               %w = sext i64 %n\n\
               %r = pair {i64, i32} %w, %x\n\
               %e = extract %r, 1\n\
               %k = const u64 0xffff_ffff_ffff_ffff\n\
               ret %r\n\
             }\n",
        );
        func.validate(&types).unwrap();
        let pair = types.field_type(func.result, 1);
        assert_eq!(pair, Some(TypeId::I32));
        match &func.nodes[2].kind {
            NodeKind::Call { callee, args, fixed } => {
                assert_eq!(callee, "printf");
                assert_eq!(args.len(), 3);
                assert_eq!(*fixed, 1);
            }
            other => panic!("expected call, got {other:?}"),
        }
        assert_eq!(func.nodes[3].ty, TypeId::VOID);
        assert_eq!(func.nodes[6].ty, TypeId::I32);
        assert_eq!(func.nodes[7].kind, NodeKind::Const(-1));
    }

    #[test]
    fn test_pair_operands_stop_at_line_end() {
        let (func, types) = parse_one(
            "func lo(i64, i64) -> i64 {\n\
             entry:\n\
               %a = param 0\n\
               %b = param 1\n\
               %p = pair {i64, i64} %a, %b\n\
               %lo = extract %p, 0\n\
               ret %lo\n\
             }\n",
        );
        func.validate(&types).unwrap();
        assert_eq!(
            func.nodes[2].kind,
            NodeKind::Aggregate(vec![NodeId::new(0), NodeId::new(1)])
        );
        assert_eq!(func.nodes[3].kind, NodeKind::Extract(NodeId::new(2), 0));
        assert_eq!(func.blocks[0].term, Some(Terminator::Ret(Some(NodeId::new(3)))));
    }

    #[test]
    fn test_errors_name_function_and_line() {
        let cases = [
            ("func f() {\nentry:\n  ret %x\n}\n", "undefined value %x"),
            ("func f() {\nentry:\n  jump nowhere\n}\n", "undefined block `nowhere`"),
            ("func f() {\nentry:\n  ret\nentry:\n  ret\n}\n", "defined twice"),
            ("func f() {\nentry:\n  %a = frob\n  ret\n}\n", "unknown instruction `frob`"),
            ("func f() {\nentry:\n  ret\n  ret\n}\n", "outside a block"),
        ];
        for (text, needle) in cases {
            let mut types = TypeRegistry::new();
            match parse_module(text, &mut types) {
                Err(CompileError::InvalidIr { func, reason }) => {
                    assert_eq!(func, "f");
                    assert!(reason.starts_with("line "), "{reason}");
                    assert!(reason.contains(needle), "{reason} lacks {needle}");
                }
                other => panic!("{text:?} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let mut types = TypeRegistry::new();
        let text = "func f() {\nentry:\n  ret\n}\nfunc f() {\nentry:\n  ret\n}\n";
        assert!(parse_module(text, &mut types).is_err());
    }
}
