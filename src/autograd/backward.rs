//! Backward pass over the computational graph

use super::Tensor;
use ndarray::Array1;
use std::collections::HashSet;
use std::rc::Rc;

/// Gradient propagation for one graph node.
///
/// `backward` reads the gradient of the node it produced and accumulates into
/// its direct inputs only; [`backward`](crate::autograd::backward) walks the
/// graph so each node runs once, after every consumer has contributed.
pub trait BackwardOp {
    /// Push this node's gradient into its direct inputs
    fn backward(&self);

    /// Direct inputs of this node
    fn inputs(&self) -> Vec<&Tensor>;
}

/// Perform backward pass on a tensor
pub fn backward(tensor: &mut Tensor, grad_output: Option<Array1<f32>>) {
    if let Some(grad) = grad_output {
        tensor.set_grad(grad);
    } else {
        // Initialize with ones for scalar loss
        tensor.set_grad(Array1::ones(tensor.len()));
    }

    for op in topological_ops(tensor) {
        op.backward();
    }
}

/// Backward ops reachable from `root`, consumers before producers
fn topological_ops(root: &Tensor) -> Vec<Rc<dyn BackwardOp>> {
    let mut visited = HashSet::new();
    let mut post_order = Vec::new();
    visit(root, &mut visited, &mut post_order);
    post_order.reverse();
    post_order
}

fn visit(node: &Tensor, visited: &mut HashSet<usize>, out: &mut Vec<Rc<dyn BackwardOp>>) {
    if !visited.insert(node.node_id()) {
        return;
    }
    if let Some(op) = node.backward_op() {
        for input in op.inputs() {
            visit(input, visited, out);
        }
        out.push(op);
    }
}
