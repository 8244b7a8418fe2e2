#![allow(unsafe_op_in_unsafe_fn)]

use numpy::{IxDyn, PyArrayDyn, PyArrayMethods};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::ensemble::{EnsembleOutput, run_ensemble};
use crate::error::SimError;
use crate::params::Params;

impl From<SimError> for PyErr {
    fn from(err: SimError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

impl EnsembleOutput {
    fn into_py(self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        let dims = [self.n_trajectories(), self.names.len()];
        let array = unsafe { PyArrayDyn::<u64>::new(py, IxDyn(&dims), false) };
        unsafe {
            array
                .as_slice_mut()
                .map_err(|_| PyValueError::new_err("failed to export data"))?
                .copy_from_slice(&self.data);
        }
        Ok(array.into_any().unbind())
    }
}

/// Runs independent replicates of a JSON run description and returns the
/// final populations of `names` as an `(n_trajectories, len(names))` array.
#[pyfunction(signature = (
    params_json,
    names,
    n_trajectories,
    n_threads=None,
    seed=None
))]
pub fn simulate_ensemble(
    py: Python<'_>,
    params_json: &str,
    names: Vec<String>,
    n_trajectories: usize,
    n_threads: Option<usize>,
    seed: Option<u64>,
) -> PyResult<Py<PyAny>> {
    let params = Params::from_json(params_json)?;
    let sim_result =
        py.detach(move || run_ensemble(&params, &names, n_trajectories, n_threads, seed))?;
    sim_result.into_py(py)
}

#[pymodule]
fn reactnet(_py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_function(wrap_pyfunction!(simulate_ensemble, module)?)?;
    Ok(())
}
