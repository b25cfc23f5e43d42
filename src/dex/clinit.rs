//! Threading a registration call through a class's static initializer.

use crate::dex::error::DexError;
use crate::dex::model::{AccessFlags, ClassDef, Code, DebugOp, InsnRef, Method, MethodRef, Proto, Reference, CLINIT};

/// Size in code units of the injected `const` + `invoke-static` prefix.
pub const PREFIX_UNITS: u32 = 6;

/// The static call to place at the start of `<clinit>`: `method(class_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationCall
{
    /// A static `(I)V` method.
    pub method: MethodRef,
    pub class_index: u32,
}

impl RegistrationCall
{
    pub fn new(holder: &str, method_name: &str, class_index: u32) -> Self
    {
        RegistrationCall { method: MethodRef::new(holder, method_name, Proto::new("V", &["I"])), class_index }
    }
}

/// Something that can make a class's static initializer run a registration call.
pub trait ClinitRewriter
{
    fn inject(&self, class: &mut ClassDef, call: &RegistrationCall) -> Result<(), DexError>;
}

/// Prepends `const vR, #index` and `invoke-static {vR}, method` to `<clinit>`,
/// creating the initializer when the class has none.
///
/// The new register is appended after the existing ones, so the body of an
/// existing initializer is left untouched apart from branch targets held
/// outside the instructions (try blocks, handlers and the debug program),
/// which move by [`PREFIX_UNITS`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PrependRegistrationCall;

fn prefix(register: u16, call: &RegistrationCall) -> Result<Vec<u16>, DexError>
{
    if register > 0xff
    {
        fail!("register v{} out of range for const", register);
    }
    let literal = call.class_index;
    let mut insns = vec![0x14 | (register << 8), literal as u16, (literal >> 16) as u16];
    if register < 16
    {
        // invoke-static {vR}
        insns.extend_from_slice(&[0x1071, 0, register]);
    }
    else
    {
        // invoke-static/range {vR .. vR}
        insns.extend_from_slice(&[0x0177, 0, register]);
    }
    Ok(insns)
}

impl ClinitRewriter for PrependRegistrationCall
{
    fn inject(&self, class: &mut ClassDef, call: &RegistrationCall) -> Result<(), DexError>
    {
        let call_ref = InsnRef { pc: 3, target: Reference::Method(call.method.clone()) };
        let descriptor = class.descriptor.clone();

        let Some(method) = class.static_initializer_mut()
        else
        {
            let mut insns = prefix(0, call)?;
            insns.push(0x000e); // return-void
            let code = Code {
                registers_size: 1,
                ins_size: 0,
                outs_size: 1,
                insns,
                refs: vec![call_ref],
                tries: vec![],
                debug_info: None,
            };
            class.direct_methods.push(Method::new(
                MethodRef::new(&descriptor, CLINIT, Proto::new("V", &[])),
                AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
                Some(code),
            ));
            return Ok(());
        };

        let Some(code) = method.code.as_mut()
        else
        {
            fail!("static initializer of {} has no code", descriptor);
        };
        if code.ins_size != 0
        {
            fail!("static initializer of {} takes {} argument registers", descriptor, code.ins_size);
        }

        let register = code.registers_size;
        let mut insns = prefix(register, call)?;
        insns.extend_from_slice(&code.insns);
        code.insns = insns;
        code.registers_size = register + 1;
        code.outs_size = code.outs_size.max(1);

        for r in code.refs.iter_mut()
        {
            r.pc += PREFIX_UNITS;
        }
        code.refs.insert(0, call_ref);

        for t in code.tries.iter_mut()
        {
            t.start_addr += PREFIX_UNITS;
            for c in t.handler.catches.iter_mut()
            {
                c.addr += PREFIX_UNITS;
            }
            if let Some(addr) = t.handler.catch_all.as_mut()
            {
                *addr += PREFIX_UNITS;
            }
        }

        if let Some(debug) = code.debug_info.as_mut()
        {
            debug.program.insert(0, DebugOp::AdvancePc(PREFIX_UNITS));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::dex::model::{CatchHandler, DebugInfo, TryBlock, TypeAddrPair};

    fn call() -> RegistrationCall
    {
        RegistrationCall::new("Lcom/app/Bridge;", "register0", 3)
    }

    #[test]
    fn creates_missing_initializer()
    {
        let mut class = ClassDef::new("Lcom/app/A;", Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
        PrependRegistrationCall.inject(&mut class, &call()).unwrap();

        let clinit = class.static_initializer().unwrap();
        assert_eq!(clinit.access, AccessFlags::STATIC | AccessFlags::CONSTRUCTOR);
        let code = clinit.code.as_ref().unwrap();
        assert_eq!(code.insns, vec![0x0014, 3, 0, 0x1071, 0, 0, 0x000e]);
        assert_eq!(code.registers_size, 1);
        assert_eq!(code.outs_size, 1);
        assert_eq!(code.refs[0].target, Reference::Method(call().method));
    }

    /// `const-string v0, "s" ; return-void` guarded by a catch-all at 2.
    fn class_with_initializer(registers_size: u16) -> ClassDef
    {
        let mut class = ClassDef::new("Lcom/app/A;", Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
        class.direct_methods.push(Method::new(
            MethodRef::new("Lcom/app/A;", CLINIT, Proto::new("V", &[])),
            AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
            Some(Code {
                registers_size,
                ins_size: 0,
                outs_size: 0,
                insns: vec![0x001a, 0, 0x000e],
                refs: vec![InsnRef { pc: 0, target: Reference::String("s".to_string()) }],
                tries: vec![TryBlock {
                    start_addr: 0,
                    insn_count: 2,
                    handler: CatchHandler {
                        catches: vec![TypeAddrPair { exception: "Ljava/lang/Throwable;".to_string(), addr: 2 }],
                        catch_all: Some(2),
                    },
                }],
                debug_info: Some(DebugInfo { line_start: 1, parameter_names: vec![], program: vec![DebugOp::Special(0x0e)] }),
            }),
        ));
        class
    }

    #[test]
    fn prepends_to_existing_initializer()
    {
        let mut class = class_with_initializer(2);
        let body = vec![0x001a, 0, 0x000e];

        PrependRegistrationCall.inject(&mut class, &call()).unwrap();
        let code = class.static_initializer().unwrap().code.as_ref().unwrap();
        assert_eq!(&code.insns[..6], &[0x0214, 3, 0, 0x1071, 0, 2]);
        assert_eq!(&code.insns[6..], body.as_slice());
        assert_eq!(code.registers_size, 3);
        assert_eq!(code.outs_size, 1);
        assert_eq!(code.refs[1].pc, 6);
        assert_eq!(code.tries[0].start_addr, 6);
        assert_eq!(code.tries[0].handler.catches[0].addr, 8);
        assert_eq!(code.tries[0].handler.catch_all, Some(8));
        assert_eq!(code.debug_info.as_ref().unwrap().program[0], DebugOp::AdvancePc(6));
    }

    #[test]
    fn high_registers_use_range_form_and_overflow_fails()
    {
        let insns = prefix(20, &call()).unwrap();
        assert_eq!(insns[0], 0x1414);
        assert_eq!(&insns[3..], &[0x0177, 0, 20]);
        assert!(prefix(256, &call()).is_err());
    }

    #[test]
    fn rewritten_class_still_encodes()
    {
        let mut class = ClassDef::new("Lcom/app/A;", Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
        PrependRegistrationCall.inject(&mut class, &call()).unwrap();
        let bytes = crate::dex::write_dex(&[class], 35).unwrap();
        let unit = crate::dex::DexUnit::from_bytes(&bytes).unwrap();
        let code = unit.classes[0].static_initializer().unwrap().code.as_ref().unwrap();
        assert_eq!(code.refs, vec![InsnRef { pc: 3, target: Reference::Method(call().method) }]);
    }

    #[test]
    fn prepended_initializer_survives_encoding()
    {
        let mut class = class_with_initializer(18);
        PrependRegistrationCall.inject(&mut class, &call()).unwrap();
        let bytes = crate::dex::write_dex(&[class], 35).unwrap();
        let unit = crate::dex::DexUnit::from_bytes(&bytes).unwrap();

        let code = unit.classes[0].static_initializer().unwrap().code.as_ref().unwrap();
        assert_eq!(code.registers_size, 19);
        assert_eq!(code.outs_size, 1);
        // const v18, #3 ; invoke-static/range {v18}
        assert_eq!(&code.insns[..3], &[0x1214, 3, 0]);
        assert_eq!(code.insns[3], 0x0177);
        assert_eq!(code.insns[5], 18);
        assert_eq!(code.insns[8], 0x000e);
        assert_eq!(
            code.refs,
            vec![
                InsnRef { pc: 3, target: Reference::Method(call().method) },
                InsnRef { pc: 6, target: Reference::String("s".to_string()) },
            ]
        );
        assert_eq!(code.tries.len(), 1);
        assert_eq!(code.tries[0].start_addr, 6);
        assert_eq!(code.tries[0].insn_count, 2);
        assert_eq!(code.tries[0].handler.catches[0].exception, "Ljava/lang/Throwable;");
        assert_eq!(code.tries[0].handler.catches[0].addr, 8);
        assert_eq!(code.tries[0].handler.catch_all, Some(8));
        let debug = code.debug_info.as_ref().unwrap();
        assert_eq!(debug.program.first(), Some(&DebugOp::AdvancePc(6)));
    }
}
