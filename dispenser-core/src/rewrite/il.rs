use std::fmt;

use super::StackEffect;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Nop,
    LoadArg,
    LoadLocal,
    StoreLocal,
    LoadStaticField,
    LoadField,
    StoreField,
    Call,
    LoadInt,
    LoadNull,
    Dup,
    Pop,
    Mul,
    Ret,
}

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Nop => "nop",
            OpCode::LoadArg => "ldarg",
            OpCode::LoadLocal => "ldloc",
            OpCode::StoreLocal => "stloc",
            OpCode::LoadStaticField => "ldsfld",
            OpCode::LoadField => "ldfld",
            OpCode::StoreField => "stfld",
            OpCode::Call => "call",
            OpCode::LoadInt => "ldc",
            OpCode::LoadNull => "ldnull",
            OpCode::Dup => "dup",
            OpCode::Pop => "pop",
            OpCode::Mul => "mul",
            OpCode::Ret => "ret",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Self> {
        let op = match name {
            "nop" => OpCode::Nop,
            "ldarg" => OpCode::LoadArg,
            "ldloc" => OpCode::LoadLocal,
            "stloc" => OpCode::StoreLocal,
            "ldsfld" => OpCode::LoadStaticField,
            "ldfld" => OpCode::LoadField,
            "stfld" => OpCode::StoreField,
            "call" => OpCode::Call,
            "ldc" => OpCode::LoadInt,
            "ldnull" => OpCode::LoadNull,
            "dup" => OpCode::Dup,
            "pop" => OpCode::Pop,
            "mul" => OpCode::Mul,
            "ret" => OpCode::Ret,
            _ => return None,
        };
        Some(op)
    }
}

/// `Owner:name` reference to a field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
}

impl FieldRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Splits `Owner:name` at the first colon.
    pub fn parse(path: &str) -> Option<Self> {
        let (owner, name) = path.split_once(':')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(owner, name))
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.name)
    }
}

/// Method reference with just enough signature to know its stack effect.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub owner: String,
    pub name: String,
    pub params: u8,
    pub instance: bool,
    pub returns: bool,
}

impl MethodRef {
    pub fn new_static(owner: impl Into<String>, name: impl Into<String>, params: u8, returns: bool) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            params,
            instance: false,
            returns,
        }
    }

    pub fn new_instance(owner: impl Into<String>, name: impl Into<String>, params: u8, returns: bool) -> Self {
        Self {
            instance: true,
            ..Self::new_static(owner, name, params, returns)
        }
    }

    /// Same owner and name, regardless of the recorded signature.
    pub fn same_target(&self, other: &MethodRef) -> bool {
        self.owner == other.owner && self.name == other.name
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance {
            f.write_str("instance ")?;
        }
        write!(f, "{}:{}/{}", self.owner, self.name, self.params)?;
        if self.returns {
            f.write_str(" -> value")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    None,
    Slot(u16),
    Int(i64),
    Field(FieldRef),
    Method(MethodRef),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    pub fn simple(opcode: OpCode) -> Self {
        Self::new(opcode, Operand::None)
    }

    pub fn load_arg(slot: u16) -> Self {
        Self::new(OpCode::LoadArg, Operand::Slot(slot))
    }

    pub fn load_local(slot: u16) -> Self {
        Self::new(OpCode::LoadLocal, Operand::Slot(slot))
    }

    pub fn store_local(slot: u16) -> Self {
        Self::new(OpCode::StoreLocal, Operand::Slot(slot))
    }

    pub fn load_static(field: FieldRef) -> Self {
        Self::new(OpCode::LoadStaticField, Operand::Field(field))
    }

    pub fn load_field(field: FieldRef) -> Self {
        Self::new(OpCode::LoadField, Operand::Field(field))
    }

    pub fn store_field(field: FieldRef) -> Self {
        Self::new(OpCode::StoreField, Operand::Field(field))
    }

    pub fn call(method: MethodRef) -> Self {
        Self::new(OpCode::Call, Operand::Method(method))
    }

    pub fn load_int(value: i64) -> Self {
        Self::new(OpCode::LoadInt, Operand::Int(value))
    }

    pub fn is_load_static(&self, field: &FieldRef) -> bool {
        self.opcode == OpCode::LoadStaticField && self.operand == Operand::Field(field.clone())
    }

    pub fn is_store_field(&self, field: &FieldRef) -> bool {
        self.opcode == OpCode::StoreField && self.operand == Operand::Field(field.clone())
    }

    pub fn is_store_local(&self, slot: u16) -> bool {
        self.opcode == OpCode::StoreLocal && self.operand == Operand::Slot(slot)
    }

    pub fn calls(&self, method: &MethodRef) -> bool {
        match (&self.opcode, &self.operand) {
            (OpCode::Call, Operand::Method(m)) => m.same_target(method),
            _ => false,
        }
    }
}

impl StackEffect for Instruction {
    /// `ret` leaves the frame, so it is counted as neutral.
    fn stack_delta(&self) -> i32 {
        match self.opcode {
            OpCode::Nop | OpCode::Ret | OpCode::LoadField => 0,
            OpCode::LoadArg
            | OpCode::LoadLocal
            | OpCode::LoadStaticField
            | OpCode::LoadInt
            | OpCode::LoadNull
            | OpCode::Dup => 1,
            OpCode::StoreLocal | OpCode::Pop | OpCode::Mul => -1,
            OpCode::StoreField => -2,
            OpCode::Call => match &self.operand {
                Operand::Method(m) => {
                    let popped = m.params as i32 + i32::from(m.instance);
                    i32::from(m.returns) - popped
                }
                _ => 0,
            },
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Slot(slot) => write!(f, " {slot}"),
            Operand::Int(value) => write!(f, " {value}"),
            Operand::Field(field) => write!(f, " {field}"),
            Operand::Method(method) => write!(f, " {method}"),
        }
    }
}
