mod instruction;

pub use instruction::Instruction;

/// Instruction format modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
    IsJ,
}

/// Opcode set.
///
/// Comparison and test instructions skip the next instruction when the
/// condition does not hold; the next instruction is always a `Jmp`/`JmpX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // Load/Move operations
    Move = 0, // R[A] := R[B]
    LoadK,    // R[A] := K[Bx]
    LoadI,    // R[A] := sBx
    LoadBool, // R[A] := (B != 0); if C then pc++
    LoadNull, // R[A], R[A+1], ..., R[A+B] := null

    // Upvalues and globals
    GetUpval,  // R[A] := UpValue[B]
    SetUpval,  // UpValue[B] := R[A]
    GetGlobal, // R[A] := Env[K[Bx]]
    SetGlobal, // Env[K[Bx]] := R[A]
    GetImport, // R[A] := K[Bx] (import resolved at load)

    // Tables
    NewTable, // R[A] := {} (B: size hint)
    DupTable, // R[A] := {} sized after the shape in K[Bx]
    GetTable, // R[A] := R[B][R[C]]
    SetTable, // R[A][R[B]] := R[C]
    GetField, // R[A] := R[B][K[C]:string]
    SetField, // R[A][K[B]:string] := R[C]

    // Arithmetic
    Add,    // R[A] := R[B] + R[C]
    Sub,    // R[A] := R[B] - R[C]
    Mul,    // R[A] := R[B] * R[C]
    Div,    // R[A] := R[B] / R[C]
    Mod,    // R[A] := R[B] % R[C]
    Pow,    // R[A] := R[B] ^ R[C]
    Unm,    // R[A] := -R[B]
    Not,    // R[A] := not R[B]
    Len,    // R[A] := #R[B]
    Concat, // R[A] := R[B] .. ... .. R[C]

    // Comparison
    Eq,   // if ((R[A] == R[B]) ~= k) then pc++
    Lt,   // if ((R[A] <  R[B]) ~= k) then pc++
    Le,   // if ((R[A] <= R[B]) ~= k) then pc++
    Test, // if (not R[A] == k) then pc++

    // Jumps
    Jmp,      // pc += sBx
    JmpX,     // pc += sJ
    JmpIf,    // if R[A] then pc += sBx
    JmpIfNot, // if not R[A] then pc += sBx

    // Calls and closures
    Call,       // R[A], ... ,R[A+C-2] := R[A](R[A+1], ... ,R[A+B-1])
    Return,     // return R[A], ... ,R[A+B-2]
    VarArg,     // R[A], R[A+1], ..., R[A+C-2] = vararg
    Closure,    // R[A] := closure(KPROTO[Bx])
    DupClosure, // R[A] := closure(K[Bx]:proto)
    Close,      // close all upvalues >= R[A]

    // Coroutines
    NewThread, // R[A] := new thread running R[B]
    Resume,    // R[A], ..., R[A+C-2] := resume R[A](R[A+1], ..., R[A+B-1]); k: prepend success flag
    Yield,     // yield R[A], ..., R[A+B-2]; resume values land in R[A], ..., R[A+C-2]

    Nop,
    // Extra argument
    ExtraArg, // extra (larger) argument for previous opcode
}

impl OpCode {
    pub const COUNT: u8 = OpCode::ExtraArg as u8 + 1;

    #[inline(always)]
    pub fn from_u8(byte: u8) -> Option<Self> {
        if byte < Self::COUNT {
            // SAFETY: OpCode is repr(u8) with contiguous discriminants 0..COUNT
            Some(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            None
        }
    }

    /// Instructions that read the stack top left by the previous instruction
    pub fn uses_top(self) -> bool {
        use OpCode::*;
        matches!(self, Call | Return | Resume | Yield)
    }

    /// Conditional skip instructions
    pub fn is_test(self) -> bool {
        use OpCode::*;
        matches!(self, Eq | Lt | Le | Test)
    }

    pub fn is_jump(self) -> bool {
        use OpCode::*;
        matches!(self, Jmp | JmpX | JmpIf | JmpIfNot)
    }

    /// Get the instruction format mode for this opcode
    pub fn get_mode(self) -> OpMode {
        use OpCode::*;
        match self {
            // iAsBx format (signed Bx)
            LoadI | Jmp | JmpIf | JmpIfNot => OpMode::IAsBx,

            // iABx format (unsigned Bx)
            LoadK | GetGlobal | SetGlobal | GetImport | DupTable | Closure | DupClosure => {
                OpMode::IABx
            }

            // isJ format (signed jump)
            JmpX => OpMode::IsJ,

            // iAx format
            ExtraArg => OpMode::IAx,

            // iABC format (everything else)
            _ => OpMode::IABC,
        }
    }

    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadK => "LOADK",
            LoadI => "LOADI",
            LoadBool => "LOADBOOL",
            LoadNull => "LOADNULL",
            GetUpval => "GETUPVAL",
            SetUpval => "SETUPVAL",
            GetGlobal => "GETGLOBAL",
            SetGlobal => "SETGLOBAL",
            GetImport => "GETIMPORT",
            NewTable => "NEWTABLE",
            DupTable => "DUPTABLE",
            GetTable => "GETTABLE",
            SetTable => "SETTABLE",
            GetField => "GETFIELD",
            SetField => "SETFIELD",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Unm => "UNM",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            Jmp => "JMP",
            JmpX => "JMPX",
            JmpIf => "JMPIF",
            JmpIfNot => "JMPIFNOT",
            Call => "CALL",
            Return => "RETURN",
            VarArg => "VARARG",
            Closure => "CLOSURE",
            DupClosure => "DUPCLOSURE",
            Close => "CLOSE",
            NewThread => "NEWTHREAD",
            Resume => "RESUME",
            Yield => "YIELD",
            Nop => "NOP",
            ExtraArg => "EXTRAARG",
        }
    }
}
