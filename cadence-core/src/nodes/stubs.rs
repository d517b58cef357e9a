//! Stub nodes placed at the edges of nested graphs.
//!
//! A nested graph receives its outer inputs through reference stubs: the
//! owning node copies the binding of its own input onto the stub's `ts`
//! input, and the stub republishes it as a reference that the nested
//! nodes dereference. Key stubs publish the key of a map instance.

use crate::error::Result;
use crate::graph::{NodeBuilder, NodeContext, NodeKind, NodeLogic, NodeSignature};
use crate::series::TsType;

/// Name of a stub's input.
pub const STUB_INPUT: &str = "ts";

#[derive(Debug, Clone, Copy)]
struct ReferenceStub;

impl NodeLogic for ReferenceStub {
    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let input = ctx.input(STUB_INPUT)?;
        let output = ctx.output()?;
        let rt = ctx.runtime_mut();
        let reference = rt.reference_input_value(input).unwrap_or_default();
        if rt.output_valid(output) && rt.reference_output_value(output).as_ref() == Some(&reference) {
            return Ok(());
        }
        rt.set_reference(output, reference)
    }
}

/// Passes a reference to a time-series of type `tp` through unchanged.
pub fn reference_stub(name: &str, tp: TsType) -> NodeBuilder {
    let signature = NodeSignature::new(name, NodeKind::Compute).with_valid_inputs(Vec::<String>::new());
    NodeBuilder::new(signature, || Box::new(ReferenceStub))
        .with_inputs([(STUB_INPUT, TsType::reference(tp.clone()))])
        .with_output(TsType::reference(tp))
}

#[derive(Debug, Clone, Copy)]
struct KeyStub;

impl NodeLogic for KeyStub {
    fn eval(&mut self, _ctx: &mut NodeContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Publishes the key of a map instance; the value is set by the owning map.
pub fn key_stub(name: &str) -> NodeBuilder {
    NodeBuilder::new(NodeSignature::new(name, NodeKind::PullSource), || Box::new(KeyStub))
        .with_output(TsType::Value)
}
