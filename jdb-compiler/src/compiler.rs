//! Two-pass compiler (§4.4): pass 0 pre-scans `TYPE` blocks and
//! `IMPORT`/`EXPORT MODULE` directives; pass 1 walks the source
//! line-by-line emitting bytecode directly (no intermediate AST -- the
//! expression evaluator's precedence climb, §4.6, *is* the code
//! generator).

use crate::{
    bytecode::{Chunk, OpCode},
    errors,
    function::FunctionInfo,
    lexer::Lexer,
    token::{IdentRole, Keyword, Op, Token},
    udt::{DeclaredType, MemberInfo, TypeInfo, TypeRegistry},
};
use anyhow::{anyhow, bail, Result};
use arcstr::ArcStr;
use compact_str::CompactString;
use fxhash::{FxHashMap, FxHashSet};

/// A fully compiled program or module: its bytecode, its function table,
/// its UDT registry, and (for modules) the set of exported function
/// names. Imported modules keep their own bytecode chunk rather than
/// being concatenated into the importer's, so the VM dispatches a call
/// into module `M` against `imported_chunks["M"]` (mirroring the
/// teacher's per-module compiled-artifact registry rather than a single
/// flattened program).
#[derive(Debug, Clone, Default)]
pub struct CompiledModule {
    pub chunk: Chunk,
    pub functions: FxHashMap<ArcStr, FunctionInfo>,
    pub types: TypeRegistry,
    pub exported: Vec<ArcStr>,
    pub labels: FxHashMap<ArcStr, u16>,
    pub imported_chunks: Vec<(ArcStr, Chunk)>,
}

/// Out-of-scope file/module loading is modeled as a contract: given a
/// module name, return its source text. The CLI/embedder supplies a real
/// implementation (filesystem, network, in-memory test fixture, ...).
pub trait ModuleResolver {
    fn resolve(&self, module_name: &str) -> Result<String>;
}

/// A resolver that always fails; useful when a program is known not to
/// `IMPORT` anything.
pub struct NoModules;

impl ModuleResolver for NoModules {
    fn resolve(&self, module_name: &str) -> Result<String> {
        bail!("module '{module_name}' cannot be resolved: no module resolver configured")
    }
}

struct PosTok {
    tok: Token,
    line: u32,
}

struct IfFrame {
    pending_false_patch: Option<usize>,
    end_patches: Vec<usize>,
}

struct ForFrame {
    exit_patches: Vec<usize>,
}

struct DoFrame {
    loop_start: usize,
    exit_patches: Vec<usize>,
}

struct TryFrame {
    finally_patch: usize,
    converge_patches: Vec<usize>,
    have_finally: bool,
}

struct FuncFrame {
    end_patch: usize,
}

pub struct Compiler<'a> {
    chunk: Chunk,
    lexer: Lexer<'a>,
    cur: PosTok,
    functions: FxHashMap<ArcStr, FunctionInfo>,
    types: TypeRegistry,
    exported: Vec<ArcStr>,
    labels: FxHashMap<ArcStr, u16>,
    pending_gotos: Vec<(usize, ArcStr, u32)>,
    if_stack: Vec<IfFrame>,
    for_stack: Vec<ForFrame>,
    do_stack: Vec<DoFrame>,
    try_stack: Vec<TryFrame>,
    catch_patches: Vec<usize>,
    func_stack: Vec<FuncFrame>,
    current_type: Option<ArcStr>,
    module_name: Option<ArcStr>,
    lambda_counter: u32,
    lambda_bodies: Vec<(ArcStr, Chunk)>,
    imported_chunks: Vec<(ArcStr, Chunk)>,
    is_module: bool,
}

impl<'a> Compiler<'a> {
    fn new(src: &'a str, known_procedures: &'a FxHashSet<CompactString>, types: TypeRegistry, is_module: bool) -> Result<Self> {
        let mut lexer = Lexer::new(src, known_procedures);
        let line = lexer.line;
        let first = lexer.next_token()?;
        Ok(Self {
            chunk: Chunk::new(),
            lexer,
            cur: PosTok { tok: first, line },
            functions: FxHashMap::default(),
            types,
            exported: vec![],
            labels: FxHashMap::default(),
            pending_gotos: vec![],
            if_stack: vec![],
            for_stack: vec![],
            do_stack: vec![],
            try_stack: vec![],
            catch_patches: vec![],
            func_stack: vec![],
            current_type: None,
            module_name: None,
            lambda_counter: 0,
            lambda_bodies: vec![],
            imported_chunks: vec![],
            is_module,
        })
    }

    fn bump(&mut self) -> Result<Token> {
        let line = self.lexer.line;
        let next = self.lexer.next_token()?;
        let old = std::mem::replace(&mut self.cur, PosTok { tok: next, line });
        Ok(old.tok)
    }

    fn peek(&self) -> &Token {
        &self.cur.tok
    }

    fn cur_line(&self) -> u32 {
        self.cur.line
    }

    fn expect_op(&mut self, op: Op) -> Result<()> {
        if self.peek() == &Token::Op(op) {
            self.bump()?;
            Ok(())
        } else {
            bail!("expected operator {:?} at line {}: error {}", op, self.cur_line(), errors::SYNTAX)
        }
    }

    fn expect(&mut self, tok: Token) -> Result<()> {
        if self.peek() == &tok {
            self.bump()?;
            Ok(())
        } else {
            bail!(
                "expected {:?} but found {:?} at line {}: error {}",
                tok,
                self.peek(),
                self.cur_line(),
                errors::SYNTAX
            )
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<()> {
        self.expect(Token::Keyword(kw))
    }

    fn expect_identifier(&mut self) -> Result<ArcStr> {
        match self.bump()? {
            Token::Identifier(s) => Ok(ArcStr::from(s.as_str())),
            other => bail!("expected identifier, found {other:?} at line {}: error {}", self.cur_line(), errors::SYNTAX),
        }
    }

    fn skip_newlines(&mut self) -> Result<()> {
        while matches!(self.peek(), Token::Newline) {
            self.bump()?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Expression compiler: Pratt-style precedence climb (§4.6), directly
    // emitting opcodes. Lowest precedence first, each level recurses into
    // the next-tightest level for its operands.
    // ---------------------------------------------------------------

    fn compile_expr(&mut self) -> Result<()> {
        self.compile_or()
    }

    fn compile_or(&mut self) -> Result<()> {
        self.compile_and()?;
        while matches!(self.peek(), Token::Keyword(Keyword::Or)) {
            self.bump()?;
            self.compile_and()?;
            self.chunk.emit_op(OpCode::LogOr);
        }
        Ok(())
    }

    fn compile_and(&mut self) -> Result<()> {
        self.compile_comparison()?;
        while matches!(self.peek(), Token::Keyword(Keyword::And)) {
            self.bump()?;
            self.compile_comparison()?;
            self.chunk.emit_op(OpCode::LogAnd);
        }
        Ok(())
    }

    fn compile_comparison(&mut self) -> Result<()> {
        self.compile_additive()?;
        loop {
            let op = match self.peek() {
                Token::Op(Op::Eq) => OpCode::CmpEq,
                Token::Op(Op::Ne) => OpCode::CmpNe,
                Token::Op(Op::Lt) => OpCode::CmpLt,
                Token::Op(Op::Gt) => OpCode::CmpGt,
                Token::Op(Op::Le) => OpCode::CmpLe,
                Token::Op(Op::Ge) => OpCode::CmpGe,
                _ => break,
            };
            self.bump()?;
            self.compile_additive()?;
            self.chunk.emit_op(op);
        }
        Ok(())
    }

    fn compile_additive(&mut self) -> Result<()> {
        self.compile_term()?;
        loop {
            let op = match self.peek() {
                Token::Op(Op::Add) => OpCode::Add,
                Token::Op(Op::Sub) => OpCode::Sub,
                _ => break,
            };
            self.bump()?;
            self.compile_term()?;
            self.chunk.emit_op(op);
        }
        Ok(())
    }

    fn compile_term(&mut self) -> Result<()> {
        self.compile_power()?;
        loop {
            let op = match self.peek() {
                Token::Op(Op::Mul) => OpCode::Mul,
                Token::Op(Op::Div) => OpCode::Div,
                Token::Keyword(Keyword::Mod) => OpCode::Mod,
                _ => break,
            };
            self.bump()?;
            self.compile_power()?;
            self.chunk.emit_op(op);
        }
        Ok(())
    }

    fn compile_power(&mut self) -> Result<()> {
        self.compile_unary()?;
        if matches!(self.peek(), Token::Op(Op::Pow)) {
            self.bump()?;
            // right-associative
            self.compile_power()?;
            self.chunk.emit_op(OpCode::Pow);
        }
        Ok(())
    }

    fn compile_unary(&mut self) -> Result<()> {
        match self.peek() {
            Token::Op(Op::Sub) => {
                self.bump()?;
                self.compile_unary()?;
                self.chunk.emit_op(OpCode::Neg);
                Ok(())
            }
            Token::Keyword(Keyword::Not) => {
                self.bump()?;
                self.compile_unary()?;
                self.chunk.emit_op(OpCode::Not);
                Ok(())
            }
            _ => self.compile_primary_with_postfix(),
        }
    }

    fn compile_primary_with_postfix(&mut self) -> Result<()> {
        self.compile_primary()?;
        loop {
            match self.peek() {
                Token::LBracket => {
                    self.bump()?;
                    let mut n: u16 = 0;
                    loop {
                        self.compile_expr()?;
                        n += 1;
                        if matches!(self.peek(), Token::Comma) {
                            self.bump()?;
                        } else {
                            break;
                        }
                    }
                    self.expect(Token::RBracket).map_err(|_| anyhow!("error {}", errors::UNCLOSED_BRACKET))?;
                    self.chunk.emit_op(OpCode::LoadIndex);
                    self.chunk.emit_u8(n as u8);
                }
                Token::LBrace => {
                    self.bump()?;
                    self.compile_expr()?;
                    self.expect(Token::RBrace).map_err(|_| anyhow!("error {}", errors::UNCLOSED_BRACE))?;
                    self.chunk.emit_op(OpCode::LoadMapKey);
                }
                Token::Dot => {
                    self.bump()?;
                    let name = self.expect_identifier()?;
                    self.chunk.emit_op(OpCode::LoadMember);
                    self.chunk.emit_cstr(&name);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn compile_primary(&mut self) -> Result<()> {
        match self.bump()? {
            Token::IntegerLiteral(v) => {
                self.chunk.emit_op(OpCode::PushIntLiteral);
                self.chunk.emit_i64(v);
            }
            Token::NumberLiteral(v) => {
                self.chunk.emit_op(OpCode::PushNumberLiteral);
                self.chunk.emit_f64(v);
            }
            Token::StringLiteral(s) => {
                self.chunk.emit_op(OpCode::PushStringLiteral);
                self.chunk.emit_cstr(&s);
            }
            Token::Keyword(Keyword::True) => {
                self.chunk.emit_op(OpCode::PushBool);
                self.chunk.emit_u8(1);
            }
            Token::Keyword(Keyword::False) => {
                self.chunk.emit_op(OpCode::PushBool);
                self.chunk.emit_u8(0);
            }
            Token::Keyword(Keyword::Lambda) => self.compile_lambda()?,
            Token::Keyword(Keyword::Bsync) => {
                self.expect(Token::LParen)?;
                self.compile_expr()?;
                self.expect(Token::RParen)?;
                self.chunk.emit_op(OpCode::Bsync);
            }
            Token::Keyword(Keyword::StartTask) => {
                let name = self.expect_identifier()?;
                self.expect(Token::LParen)?;
                let argc = self.compile_arg_list()?;
                self.chunk.emit_op(OpCode::StartTask);
                self.chunk.emit_cstr(&name);
                self.chunk.emit_u8(argc);
            }
            Token::Keyword(Keyword::Await) => {
                self.compile_unary()?;
                self.chunk.emit_op(OpCode::Await);
            }
            Token::LParen => {
                self.compile_expr()?;
                self.expect(Token::RParen).map_err(|_| anyhow!("error {}", errors::UNCLOSED_PAREN))?;
            }
            Token::LBracket => self.compile_array_literal()?,
            Token::LBrace => self.compile_map_literal()?,
            Token::Identifier(name) => self.compile_identifier_primary(name.as_str())?,
            other => bail!("unexpected token {other:?} in expression at line {}: error {}", self.cur_line(), errors::INVALID_TOKEN),
        }
        Ok(())
    }

    fn compile_array_literal(&mut self) -> Result<()> {
        let mut n: u16 = 0;
        if !matches!(self.peek(), Token::RBracket) {
            loop {
                self.compile_expr()?;
                n += 1;
                if matches!(self.peek(), Token::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RBracket).map_err(|_| anyhow!("error {}", errors::UNCLOSED_BRACKET))?;
        self.chunk.emit_op(OpCode::MakeArray);
        self.chunk.emit_u16(n);
        Ok(())
    }

    fn compile_map_literal(&mut self) -> Result<()> {
        let mut n: u16 = 0;
        if !matches!(self.peek(), Token::RBrace) {
            loop {
                match self.bump()? {
                    Token::StringLiteral(s) => {
                        self.chunk.emit_op(OpCode::PushStringLiteral);
                        self.chunk.emit_cstr(&s);
                    }
                    other => bail!("expected string map key, found {other:?} at line {}: error {}", self.cur_line(), errors::SYNTAX),
                }
                self.expect(Token::Colon).or_else(|_| self.expect(Token::Op(Op::Assign)))?;
                self.compile_expr()?;
                n += 1;
                if matches!(self.peek(), Token::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RBrace).map_err(|_| anyhow!("error {}", errors::UNCLOSED_BRACE))?;
        self.chunk.emit_op(OpCode::MakeMap);
        self.chunk.emit_u16(n);
        Ok(())
    }

    fn compile_lambda(&mut self) -> Result<()> {
        let mut params = vec![];
        if !matches!(self.peek(), Token::Op(Op::Arrow)) {
            loop {
                params.push(self.expect_identifier()?);
                if matches!(self.peek(), Token::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect_op(Op::Arrow)?;
        self.lambda_counter += 1;
        let name = ArcStr::from(format!("__lambda{}", self.lambda_counter));
        self.chunk.emit_op(OpCode::MakeFuncRef);
        self.chunk.emit_cstr(&name);
        self.functions.insert(
            name.clone(),
            FunctionInfo {
                name: name.clone(),
                arity: params.len() as i32,
                is_procedure: false,
                is_exported: false,
                is_async: false,
                module_name: self.module_name.clone(),
                start_bytecode_offset: 0,
                parameter_names: params,
            },
        );
        // Compile the lambda's single expression into its own code region,
        // appended after the main program once it terminates (§4.4
        // "Lambdas": lifted to a top-level function, resolved dynamically
        // by the runtime rather than via lexical capture at compile time,
        // per §4.7).
        let saved = std::mem::replace(&mut self.chunk, Chunk::new());
        self.compile_expr()?;
        self.chunk.emit_op(OpCode::Return);
        let body = std::mem::replace(&mut self.chunk, saved);
        self.lambda_bodies.push((name, body));
        Ok(())
    }

    fn compile_identifier_primary(&mut self, name: &str) -> Result<()> {
        if matches!(self.peek(), Token::LParen) {
            self.bump()?;
            let argc = self.compile_arg_list()?;
            // `TypeName.New()` (§3): a UDT static constructor call. Only
            // recognized when `TypeName` is a known type from Pass 0 and
            // the call is zero-arg -- instantiation per §3 is always
            // default member initialization, with no constructor
            // arguments to bind.
            if let Some(type_name) = name.strip_suffix(".New").or_else(|| name.strip_suffix(".NEW")) {
                if argc == 0 && self.types.contains(type_name) {
                    self.chunk.emit_op(OpCode::NewInstance);
                    self.chunk.emit_cstr(type_name);
                    return Ok(());
                }
            }
            self.chunk.emit_op(OpCode::Call);
            self.chunk.emit_cstr(name);
            self.chunk.emit_u8(argc);
        } else {
            self.chunk.emit_op(OpCode::LoadVar);
            self.chunk.emit_cstr(name);
        }
        Ok(())
    }

    fn compile_arg_list(&mut self) -> Result<u8> {
        let mut n = 0u8;
        if !matches!(self.peek(), Token::RParen) {
            loop {
                self.compile_expr()?;
                n += 1;
                if matches!(self.peek(), Token::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen).map_err(|_| anyhow!("error {}", errors::UNCLOSED_PAREN))?;
        Ok(n)
    }

    // ---------------------------------------------------------------
    // Statement compiler
    // ---------------------------------------------------------------

    fn compile_statement(&mut self) -> Result<()> {
        match self.peek().clone() {
            Token::Label(name) => {
                self.bump()?;
                self.labels.insert(ArcStr::from(name.as_str()), self.chunk.len() as u16);
                self.resolve_pending_gotos();
            }
            Token::Keyword(Keyword::Let) => {
                self.bump()?;
                self.compile_assignment()?;
            }
            Token::Keyword(Keyword::Dim) => {
                self.bump()?;
                let name = self.expect_identifier()?;
                self.chunk.emit_op(OpCode::Dim);
                self.chunk.emit_cstr(&name);
            }
            Token::Keyword(Keyword::Print) => {
                self.bump()?;
                let mut n = 0u8;
                if !matches!(self.peek(), Token::Newline | Token::Colon | Token::Eof) {
                    loop {
                        self.compile_expr()?;
                        n += 1;
                        if matches!(self.peek(), Token::Comma) {
                            self.bump()?;
                        } else {
                            break;
                        }
                    }
                }
                self.chunk.emit_op(OpCode::Print);
                self.chunk.emit_u8(n);
            }
            Token::Keyword(Keyword::Input) => {
                self.bump()?;
                let name = self.expect_identifier()?;
                self.chunk.emit_op(OpCode::Input);
                self.chunk.emit_cstr(&name);
            }
            Token::Keyword(Keyword::If) => self.compile_if()?,
            Token::Keyword(Keyword::ElseIf) => self.compile_elseif()?,
            Token::Keyword(Keyword::Else) => self.compile_else()?,
            Token::Keyword(Keyword::EndIf) => self.compile_endif()?,
            Token::Keyword(Keyword::For) => self.compile_for()?,
            Token::Keyword(Keyword::Next) => self.compile_next()?,
            Token::Keyword(Keyword::ExitFor) => self.compile_exit_for()?,
            Token::Keyword(Keyword::Do) => self.compile_do()?,
            Token::Keyword(Keyword::Loop) => self.compile_loop()?,
            Token::Keyword(Keyword::ExitDo) => self.compile_exit_do()?,
            Token::Keyword(Keyword::Func) | Token::Keyword(Keyword::Sub) => self.compile_func(false)?,
            Token::Keyword(Keyword::EndFunc) | Token::Keyword(Keyword::EndSub) => self.compile_endfunc()?,
            Token::Keyword(Keyword::Return) => {
                self.bump()?;
                if self.func_stack.is_empty() {
                    bail!("RETURN without function call at line {}: error {}", self.cur_line(), errors::RETURN_WITHOUT_CALL);
                }
                if !matches!(self.peek(), Token::Newline | Token::Colon | Token::Eof) {
                    self.compile_expr()?;
                } else {
                    self.chunk.emit_op(OpCode::PushBool);
                    self.chunk.emit_u8(0);
                }
                self.chunk.emit_op(OpCode::Return);
            }
            Token::Keyword(Keyword::Goto) => {
                self.bump()?;
                let name = self.expect_identifier()?;
                self.chunk.emit_op(OpCode::Goto);
                let at = self.chunk.emit_placeholder();
                if let Some(addr) = self.labels.get(&name) {
                    self.chunk.patch_u16(at, *addr);
                } else {
                    self.pending_gotos.push((at, name, self.cur_line()));
                }
            }
            Token::Keyword(Keyword::Await) | Token::Keyword(Keyword::Bsync) | Token::Keyword(Keyword::StartTask) => {
                // Bare `AWAIT x` / `BSYNC(...)` / `STARTTASK f(...)` as a
                // whole statement: compile as an expression and discard
                // the result, same as a bare call statement.
                self.compile_expr()?;
                self.chunk.emit_op(OpCode::Pop);
            }
            Token::Keyword(Keyword::Try) => self.compile_try()?,
            Token::Keyword(Keyword::Catch) => self.compile_catch()?,
            Token::Keyword(Keyword::Finally) => self.compile_finally()?,
            Token::Keyword(Keyword::EndTry) => self.compile_endtry()?,
            Token::Keyword(Keyword::Raise) => self.compile_raise_event()?,
            Token::Keyword(Keyword::OnEvent) => self.compile_on_event()?,
            Token::Keyword(Keyword::Type) => self.compile_type_decl()?,
            Token::Keyword(Keyword::EndType) => {
                self.bump()?;
                self.current_type = None;
            }
            Token::Keyword(Keyword::Import) => {
                // resolved and linked in `compile_unit`; just consume the name here.
                self.bump()?;
                let _ = self.expect_identifier()?;
            }
            Token::Keyword(Keyword::Export) => {
                self.bump()?;
                if matches!(self.peek(), Token::Keyword(Keyword::Module)) {
                    self.bump()?;
                    let name = self.expect_identifier()?;
                    self.module_name = Some(name);
                } else {
                    self.compile_func(true)?;
                }
            }
            Token::Keyword(Keyword::Option) => {
                self.bump()?;
                let _ = self.expect_identifier();
            }
            Token::Keyword(Keyword::Stop) => {
                self.bump()?;
            }
            Token::Identifier(name) => {
                let role = self.lexer.classify(name.as_str(), true);
                self.bump()?;
                match role {
                    IdentRole::Call => {
                        if matches!(self.peek(), Token::LParen) {
                            self.bump()?;
                            let argc = self.compile_arg_list()?;
                            self.chunk.emit_op(OpCode::Call);
                            self.chunk.emit_cstr(&name);
                            self.chunk.emit_u8(argc);
                        } else {
                            self.chunk.emit_op(OpCode::Call);
                            self.chunk.emit_cstr(&name);
                            self.chunk.emit_u8(0);
                        }
                        self.chunk.emit_op(OpCode::Pop);
                    }
                    _ => self.compile_assignment_target(&name)?,
                }
            }
            Token::Newline | Token::Colon => {
                self.bump()?;
            }
            Token::Eof => {}
            other => bail!("unexpected statement token {other:?} at line {}: error {}", self.cur_line(), errors::SYNTAX),
        }
        Ok(())
    }

    fn compile_assignment(&mut self) -> Result<()> {
        let name = self.expect_identifier()?;
        self.compile_assignment_target(&name)
    }

    fn compile_assignment_target(&mut self, name: &str) -> Result<()> {
        if matches!(self.peek(), Token::LBracket) {
            self.bump()?;
            let mut n = 0u16;
            loop {
                self.compile_expr()?;
                n += 1;
                if matches!(self.peek(), Token::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
            self.expect(Token::RBracket)?;
            self.expect_op(Op::Assign)?;
            self.compile_expr()?;
            // stack order for StoreIndex: indices.., value; the base
            // variable name travels as an inline operand, not on the stack.
            self.chunk.emit_op(OpCode::StoreIndex);
            self.chunk.emit_cstr(name);
            self.chunk.emit_u8(n as u8);
            return Ok(());
        }
        if matches!(self.peek(), Token::LBrace) {
            self.bump()?;
            self.compile_expr()?;
            self.expect(Token::RBrace)?;
            self.expect_op(Op::Assign)?;
            self.compile_expr()?;
            self.chunk.emit_op(OpCode::StoreMapKey);
            self.chunk.emit_cstr(name);
            return Ok(());
        }
        if matches!(self.peek(), Token::Dot) {
            self.bump()?;
            let member = self.expect_identifier()?;
            self.expect_op(Op::Assign)?;
            self.compile_expr()?;
            self.chunk.emit_op(OpCode::StoreMember);
            self.chunk.emit_cstr(name);
            self.chunk.emit_cstr(&member);
            return Ok(());
        }
        self.expect_op(Op::Assign)?;
        self.compile_expr()?;
        self.chunk.emit_op(OpCode::StoreVar);
        self.chunk.emit_cstr(name);
        Ok(())
    }

    fn compile_if(&mut self) -> Result<()> {
        self.bump()?;
        self.compile_expr()?;
        if matches!(self.peek(), Token::Keyword(Keyword::Then)) {
            self.bump()?;
        }
        self.chunk.emit_op(OpCode::JumpIfFalse);
        let patch = self.chunk.emit_placeholder();
        self.if_stack.push(IfFrame { pending_false_patch: Some(patch), end_patches: vec![] });
        Ok(())
    }

    fn compile_elseif(&mut self) -> Result<()> {
        self.bump()?;
        let mut frame = self.if_stack.pop().ok_or_else(|| anyhow!("ELSEIF without IF: error {}", errors::UNCLOSED_IF))?;
        self.chunk.emit_op(OpCode::Jump);
        let end_jump = self.chunk.emit_placeholder();
        frame.end_patches.push(end_jump);
        if let Some(p) = frame.pending_false_patch.take() {
            self.chunk.patch_to_here(p);
        }
        self.compile_expr()?;
        if matches!(self.peek(), Token::Keyword(Keyword::Then)) {
            self.bump()?;
        }
        self.chunk.emit_op(OpCode::JumpIfFalse);
        let patch = self.chunk.emit_placeholder();
        frame.pending_false_patch = Some(patch);
        self.if_stack.push(frame);
        Ok(())
    }

    fn compile_else(&mut self) -> Result<()> {
        self.bump()?;
        let mut frame = self.if_stack.pop().ok_or_else(|| anyhow!("ELSE without IF: error {}", errors::UNCLOSED_IF))?;
        self.chunk.emit_op(OpCode::Jump);
        let end_jump = self.chunk.emit_placeholder();
        frame.end_patches.push(end_jump);
        if let Some(p) = frame.pending_false_patch.take() {
            self.chunk.patch_to_here(p);
        }
        self.if_stack.push(frame);
        Ok(())
    }

    fn compile_endif(&mut self) -> Result<()> {
        self.bump()?;
        let frame = self.if_stack.pop().ok_or_else(|| anyhow!("ENDIF without IF: error {}", errors::UNCLOSED_IF))?;
        if let Some(p) = frame.pending_false_patch {
            self.chunk.patch_to_here(p);
        }
        for p in frame.end_patches {
            self.chunk.patch_to_here(p);
        }
        Ok(())
    }

    fn compile_for(&mut self) -> Result<()> {
        self.bump()?;
        let var = self.expect_identifier()?;
        self.expect_op(Op::Assign)?;
        self.compile_expr()?;
        self.expect_keyword(Keyword::To)?;
        self.compile_expr()?;
        if matches!(self.peek(), Token::Keyword(Keyword::Step)) {
            self.bump()?;
            self.compile_expr()?;
        } else {
            self.chunk.emit_op(OpCode::PushIntLiteral);
            self.chunk.emit_i64(1);
        }
        self.chunk.emit_op(OpCode::ForInit);
        self.chunk.emit_cstr(&var);
        self.for_stack.push(ForFrame { exit_patches: vec![] });
        Ok(())
    }

    fn compile_next(&mut self) -> Result<()> {
        self.bump()?;
        if matches!(self.peek(), Token::Identifier(_)) {
            self.bump()?; // optional loop variable name after NEXT
        }
        let frame = self.for_stack.pop().ok_or_else(|| anyhow!("NEXT without FOR: error {}", errors::NEXT_WITHOUT_FOR))?;
        self.chunk.emit_op(OpCode::ForNext);
        for p in frame.exit_patches {
            self.chunk.patch_to_here(p);
        }
        Ok(())
    }

    fn compile_exit_for(&mut self) -> Result<()> {
        self.bump()?;
        if self.for_stack.is_empty() {
            bail!("EXIT FOR outside FOR at line {}: error {}", self.cur_line(), errors::NEXT_WITHOUT_FOR);
        }
        self.chunk.emit_op(OpCode::ExitFor);
        let patch = self.chunk.emit_placeholder();
        self.for_stack.last_mut().unwrap().exit_patches.push(patch);
        Ok(())
    }

    fn compile_do(&mut self) -> Result<()> {
        self.bump()?;
        let mut exit_patches = vec![];
        if matches!(self.peek(), Token::Keyword(Keyword::While) | Token::Keyword(Keyword::Until)) {
            let until = matches!(self.peek(), Token::Keyword(Keyword::Until));
            self.bump()?;
            let loop_start = self.chunk.len();
            self.compile_expr()?;
            if until {
                self.chunk.emit_op(OpCode::Not);
            }
            self.chunk.emit_op(OpCode::JumpIfFalse);
            let p = self.chunk.emit_placeholder();
            exit_patches.push(p);
            self.do_stack.push(DoFrame { loop_start, exit_patches });
            return Ok(());
        }
        let loop_start = self.chunk.len();
        self.do_stack.push(DoFrame { loop_start, exit_patches });
        Ok(())
    }

    fn compile_loop(&mut self) -> Result<()> {
        self.bump()?;
        let frame = self.do_stack.pop().ok_or_else(|| anyhow!("LOOP without DO: error {}", errors::UNCLOSED_LOOP))?;
        if matches!(self.peek(), Token::Keyword(Keyword::While) | Token::Keyword(Keyword::Until)) {
            let until = matches!(self.peek(), Token::Keyword(Keyword::Until));
            self.bump()?;
            self.compile_expr()?;
            if until {
                self.chunk.emit_op(OpCode::Not);
            }
            self.chunk.emit_op(OpCode::DoLoopTest);
            self.chunk.emit_u16(frame.loop_start as u16);
        } else {
            self.chunk.emit_op(OpCode::Jump);
            let p = self.chunk.emit_placeholder();
            self.chunk.patch_u16(p, frame.loop_start as u16);
        }
        for p in frame.exit_patches {
            self.chunk.patch_to_here(p);
        }
        Ok(())
    }

    fn compile_exit_do(&mut self) -> Result<()> {
        self.bump()?;
        if self.do_stack.is_empty() {
            bail!("EXIT DO outside DO at line {}: error {}", self.cur_line(), errors::UNCLOSED_LOOP);
        }
        self.chunk.emit_op(OpCode::ExitDo);
        let patch = self.chunk.emit_placeholder();
        self.do_stack.last_mut().unwrap().exit_patches.push(patch);
        Ok(())
    }

    fn compile_func(&mut self, exported: bool) -> Result<()> {
        let kw = self.bump()?; // FUNC or SUB
        let is_procedure = matches!(kw, Token::Keyword(Keyword::Sub));
        let short_name = self.expect_identifier()?;
        let name = match &self.current_type {
            Some(t) => ArcStr::from(format!("{t}.{short_name}")),
            None => short_name.clone(),
        };
        self.expect(Token::LParen)?;
        let mut params = vec![];
        let mut variadic = false;
        if !matches!(self.peek(), Token::RParen) {
            loop {
                if matches!(self.peek(), Token::Op(Op::Mul)) {
                    self.bump()?;
                    variadic = true;
                }
                params.push(self.expect_identifier()?);
                if matches!(self.peek(), Token::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        self.chunk.emit_op(OpCode::FuncDecl);
        let patch = self.chunk.emit_placeholder();
        let start = self.chunk.len() as u16;
        self.functions.insert(
            name.clone(),
            FunctionInfo {
                name: name.clone(),
                arity: if variadic { -1 } else { params.len() as i32 },
                is_procedure,
                is_exported: exported,
                is_async: false,
                module_name: self.module_name.clone(),
                start_bytecode_offset: start,
                parameter_names: params,
            },
        );
        if exported {
            self.exported.push(name.clone());
        }
        self.func_stack.push(FuncFrame { end_patch: patch });
        Ok(())
    }

    fn compile_endfunc(&mut self) -> Result<()> {
        self.bump()?;
        self.chunk.emit_op(OpCode::PushBool);
        self.chunk.emit_u8(0);
        self.chunk.emit_op(OpCode::Return);
        let frame = self.func_stack.pop().ok_or_else(|| anyhow!("ENDFUNC without FUNC: error {}", errors::UNCLOSED_FUNC))?;
        self.chunk.patch_to_here(frame.end_patch);
        Ok(())
    }

    fn compile_try(&mut self) -> Result<()> {
        self.bump()?;
        self.chunk.emit_op(OpCode::PushHandler);
        let catch_patch = self.chunk.emit_placeholder();
        let finally_patch = self.chunk.emit_placeholder();
        self.try_stack.push(TryFrame { finally_patch, converge_patches: vec![], have_finally: false });
        self.catch_patches.push(catch_patch);
        Ok(())
    }

    fn compile_catch(&mut self) -> Result<()> {
        self.bump()?;
        if matches!(self.peek(), Token::Identifier(_)) {
            self.bump()?; // optional bound exception variable, e.g. CATCH e
        }
        let frame = self.try_stack.last_mut().ok_or_else(|| anyhow!("CATCH without TRY: error {}", errors::SYNTAX))?;
        self.chunk.emit_op(OpCode::Jump);
        let skip = self.chunk.emit_placeholder();
        frame.converge_patches.push(skip);
        let catch_patch = self.catch_patches.pop().unwrap();
        self.chunk.patch_to_here(catch_patch);
        Ok(())
    }

    fn compile_finally(&mut self) -> Result<()> {
        self.bump()?;
        let frame = self.try_stack.last_mut().ok_or_else(|| anyhow!("FINALLY without TRY: error {}", errors::SYNTAX))?;
        frame.have_finally = true;
        self.chunk.patch_to_here(frame.finally_patch);
        let patches = std::mem::take(&mut frame.converge_patches);
        for p in patches {
            self.chunk.patch_to_here(p);
        }
        Ok(())
    }

    fn compile_endtry(&mut self) -> Result<()> {
        self.bump()?;
        let frame = self.try_stack.pop().ok_or_else(|| anyhow!("ENDTRY without TRY: error {}", errors::SYNTAX))?;
        if !frame.have_finally {
            self.chunk.patch_to_here(frame.finally_patch);
            for p in frame.converge_patches {
                self.chunk.patch_to_here(p);
            }
        }
        self.chunk.emit_op(OpCode::PopHandler);
        Ok(())
    }

    fn compile_raise_event(&mut self) -> Result<()> {
        self.bump()?;
        self.expect_keyword(Keyword::Event)?;
        let name = self.expect_identifier()?;
        if matches!(self.peek(), Token::Comma) {
            self.bump()?;
            self.compile_expr()?;
        } else {
            self.chunk.emit_op(OpCode::PushBool);
            self.chunk.emit_u8(0);
        }
        self.chunk.emit_op(OpCode::RaiseEvent);
        self.chunk.emit_cstr(&name);
        Ok(())
    }

    fn compile_on_event(&mut self) -> Result<()> {
        self.bump()?;
        self.expect_keyword(Keyword::Event)?;
        let name = self.expect_identifier()?;
        self.expect(Token::Op(Op::Arrow)).or_else(|_| self.expect(Token::Comma))?;
        let handler = self.expect_identifier()?;
        self.chunk.emit_op(OpCode::OnEvent);
        self.chunk.emit_cstr(&name);
        self.chunk.emit_cstr(&handler);
        Ok(())
    }

    fn compile_type_decl(&mut self) -> Result<()> {
        self.bump()?;
        let name = self.expect_identifier()?;
        self.current_type = Some(name);
        // member declarations (`NAME AS KIND`) were already captured by
        // `prescan`; skip them here until ENDTYPE or the first FUNC/SUB.
        loop {
            match self.peek() {
                Token::Keyword(Keyword::EndType) | Token::Keyword(Keyword::Func) | Token::Keyword(Keyword::Sub) | Token::Eof => break,
                _ => {
                    self.bump()?;
                }
            }
        }
        Ok(())
    }

    fn resolve_pending_gotos(&mut self) {
        let mut remaining = vec![];
        for (at, name, line) in self.pending_gotos.drain(..) {
            if let Some(addr) = self.labels.get(&name) {
                self.chunk.patch_u16(at, *addr);
            } else {
                remaining.push((at, name, line));
            }
        }
        self.pending_gotos = remaining;
    }

    fn finish(mut self) -> Result<CompiledModule> {
        if !self.if_stack.is_empty() {
            bail!("unclosed IF: error {}", errors::UNCLOSED_IF);
        }
        if !self.func_stack.is_empty() {
            bail!("unclosed FUNC: error {}", errors::UNCLOSED_FUNC);
        }
        if !self.for_stack.is_empty() || !self.do_stack.is_empty() {
            bail!("unclosed loop: error {}", errors::UNCLOSED_LOOP);
        }
        self.chunk.emit_op(OpCode::NoCmd);

        // Append lambda bodies now that the main program has terminated
        // (§4.4 "Lambdas": after the main program's bytecode ends, the
        // compiler walks the pending-lambda queue and appends each
        // lifted body, patching its start-bytecode-offset).
        for (name, body) in self.lambda_bodies.drain(..) {
            let start = self.chunk.len() as u16;
            self.chunk.code.extend_from_slice(&body.code);
            self.chunk.emit_op(OpCode::NoCmd);
            if let Some(f) = self.functions.get_mut(&name) {
                f.start_bytecode_offset = start;
            }
        }

        if !self.pending_gotos.is_empty() {
            let (_, name, line) = &self.pending_gotos[0];
            bail!("undefined label '{name}' referenced at line {line}: error {}", errors::UNDEFINED_LABEL);
        }

        Ok(CompiledModule {
            chunk: self.chunk,
            functions: self.functions,
            types: self.types,
            exported: self.exported,
            labels: self.labels,
            imported_chunks: self.imported_chunks,
        })
    }

    fn compile_all(&mut self) -> Result<()> {
        self.skip_newlines()?;
        if self.is_module {
            self.expect_keyword(Keyword::Export)?;
            self.expect_keyword(Keyword::Module)?;
            let name = self.expect_identifier()?;
            self.module_name = Some(name);
            self.skip_newlines()?;
        }
        let mut last_marked_line: Option<u32> = None;
        loop {
            if matches!(self.peek(), Token::Eof) {
                break;
            }
            // One `LineMarker` per distinct source line (§4.5); statements
            // sharing a `:`-joined line don't get a second one.
            if last_marked_line != Some(self.cur_line()) {
                self.chunk.emit_line_marker(self.cur_line() as u16);
                last_marked_line = Some(self.cur_line());
            }
            self.compile_statement()?;
            match self.peek() {
                Token::Colon | Token::Newline => {
                    self.bump()?;
                }
                Token::Eof => break,
                other => bail!("expected end of statement, found {other:?} at line {}: error {}", self.cur_line(), errors::SYNTAX),
            }
        }
        Ok(())
    }
}

/// Scan the source once to discover `FUNC`/`SUB` names (including methods
/// declared inside `TYPE` blocks) so the lexer can classify bareword
/// procedure calls (§4.3), plus `TYPE` member/method layouts and
/// `IMPORT`/`EXPORT MODULE` directives (§4.4 "Pass 0").
pub fn prescan(source: &str) -> Result<(FxHashSet<CompactString>, TypeRegistry, Vec<ArcStr>, Option<ArcStr>)> {
    let mut procs = FxHashSet::default();
    let empty = FxHashSet::default();
    let mut lex = Lexer::new(source, &empty);
    let mut types = TypeRegistry::new();
    let mut imports = vec![];
    let mut export_module = None;
    let mut current_type: Option<TypeInfo> = None;
    let mut prev_was_newline = true;
    loop {
        let tok = lex.next_token()?;
        if tok == Token::Eof {
            break;
        }
        match &tok {
            Token::Keyword(Keyword::Func) | Token::Keyword(Keyword::Sub) => {
                if let Token::Identifier(name) = lex.next_token()? {
                    let qualified = match &current_type {
                        Some(t) => format!("{}.{}", t.name, name),
                        None => name.to_string(),
                    };
                    procs.insert(CompactString::from(qualified.as_str()));
                    if let Some(t) = &mut current_type {
                        t.methods.insert(ArcStr::from(name.as_str()), ArcStr::from(qualified));
                    }
                }
            }
            Token::Keyword(Keyword::Type) => {
                if let Token::Identifier(name) = lex.next_token()? {
                    current_type = Some(TypeInfo::new(name.as_str()));
                }
            }
            Token::Keyword(Keyword::EndType) => {
                if let Some(t) = current_type.take() {
                    types.insert(t);
                }
            }
            Token::Identifier(member) if current_type.is_some() => {
                let save = member.clone();
                let next = lex.next_token()?;
                if next == Token::Keyword(Keyword::As) {
                    let kind_tok = lex.next_token()?;
                    let decl = match kind_tok {
                        Token::Keyword(Keyword::IntegerKw) => DeclaredType::Integer,
                        Token::Keyword(Keyword::DoubleKw) => DeclaredType::Number,
                        Token::Keyword(Keyword::StringKw) => DeclaredType::StringT,
                        Token::Keyword(Keyword::BoolKw) => DeclaredType::Bool,
                        Token::Keyword(Keyword::MapKw) => DeclaredType::Map,
                        Token::Keyword(Keyword::DateTimeKw) => DeclaredType::DateTime,
                        Token::Identifier(n) => DeclaredType::Named(ArcStr::from(n.as_str())),
                        _ => DeclaredType::Number,
                    };
                    if let Some(t) = &mut current_type {
                        t.members.insert(
                            ArcStr::from(save.as_str()),
                            MemberInfo { name: ArcStr::from(save.as_str()), declared_type: decl },
                        );
                    }
                }
            }
            Token::Keyword(Keyword::Import) => {
                if let Token::Identifier(name) = lex.next_token()? {
                    imports.push(ArcStr::from(name.as_str()));
                }
            }
            Token::Keyword(Keyword::Export) => {
                if prev_was_newline {
                    let next = lex.next_token()?;
                    if next == Token::Keyword(Keyword::Module) {
                        if let Token::Identifier(name) = lex.next_token()? {
                            export_module = Some(ArcStr::from(name.as_str()));
                        }
                    }
                }
            }
            _ => {}
        }
        prev_was_newline = tok == Token::Newline;
    }
    Ok((procs, types, imports, export_module))
}

/// Compile `source` as the main program, resolving any `IMPORT`s via
/// `resolver` and linking their exported functions into the returned
/// module's function table under `MODULE.FUNCTION` keys (§4.4 "Module
/// linking").
pub fn compile_program(source: &str, resolver: &dyn ModuleResolver) -> Result<CompiledModule> {
    compile_unit(source, resolver, false)
}

/// Compile `source` as an importable module (its first non-blank line
/// must be `EXPORT MODULE <NAME>`).
pub fn compile_module(source: &str, resolver: &dyn ModuleResolver) -> Result<CompiledModule> {
    compile_unit(source, resolver, true)
}

fn compile_unit(source: &str, resolver: &dyn ModuleResolver, is_module: bool) -> Result<CompiledModule> {
    let (procs, types, imports, _export_name) = prescan(source)?;
    let mut compiler = Compiler::new(source, &procs, types, is_module)?;

    for import in &imports {
        let module_src = resolver.resolve(import)?;
        let compiled = compile_module(&module_src, resolver)?;
        for name in &compiled.exported {
            if let Some(info) = compiled.functions.get(name) {
                let key = ArcStr::from(format!("{import}.{}", short_name(name)));
                compiler.functions.insert(key, info.clone());
            }
        }
        compiler.imported_chunks.push((import.clone(), compiled.chunk));
        compiler.imported_chunks.extend(compiled.imported_chunks);
    }

    compiler.compile_all()?;
    compiler.finish()
}

fn short_name(mangled: &str) -> &str {
    mangled.rsplit('.').next().unwrap_or(mangled)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::OpCode;

    #[test]
    fn type_new_compiles_to_new_instance_opcode() {
        let src = "TYPE Point\nX AS DOUBLE\nY AS DOUBLE\nENDTYPE\nLET P = Point.New()\n";
        let compiled = compile_program(src, &NoModules).expect("compiles");
        assert!(compiled.types.contains("Point"));
        assert!(compiled.chunk.code.contains(&(OpCode::NewInstance as u8)));
    }

    #[test]
    fn bare_dot_member_is_not_mistaken_for_a_constructor() {
        // `P.name` with no trailing call must never reach compile_identifier_primary's
        // `.New` special case -- it lexes as separate Identifier/Dot/Identifier tokens.
        let src = "LET P = {\"name\":\"Ada\"}\nPRINT P.name\n";
        let compiled = compile_program(src, &NoModules).expect("compiles");
        assert!(compiled.chunk.code.contains(&(OpCode::LoadMember as u8)));
    }
}
