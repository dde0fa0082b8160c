//! minsar: orchestration core for InSAR time-series processing
//!
//! Decides, per satellite, how SAR data is found, downloaded, unpacked and
//! handed to the ISCE2 stack processors, then drives the resulting run files
//! through a batch scheduler without overfilling its queues.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    Direction, DirectoryLayout, DownloadMethod, MinsarError, MinsarResult, ProcessingStack,
    SchedulerKind, UnpackHandler,
};

pub use crate::config::Settings;
pub use crate::core::{
    JobBuilder, JobFile, JobState, SatelliteConfig, SatelliteRegistry, Scheduler, Throttle,
    ThrottleConfig,
};
pub use crate::io::{CommandRunner, DownloadRequest, ProjectName, Template, Unpacker};

#[cfg(feature = "python")]
mod python {
    use crate::core::registry::{SatelliteConfig, SatelliteRegistry};
    use crate::io::project::ProjectName;
    use crate::types::MinsarError;
    use pyo3::prelude::*;

    fn to_py_err(e: MinsarError) -> PyErr {
        match e {
            MinsarError::UnknownSatellite(_) | MinsarError::DownloadMethod(_) => {
                PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
            }
            _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
        }
    }

    fn registry() -> PyResult<&'static SatelliteRegistry> {
        SatelliteRegistry::builtin().map_err(to_py_err)
    }

    /// Python view of a satellite configuration
    #[pyclass(name = "Satellite")]
    #[derive(Clone)]
    struct PySatellite {
        inner: SatelliteConfig,
    }

    #[pymethods]
    impl PySatellite {
        #[getter]
        fn id(&self) -> &str {
            self.inner.id
        }

        #[getter]
        fn name(&self) -> &str {
            self.inner.name
        }

        #[getter]
        fn abbreviation(&self) -> &str {
            self.inner.abbreviation
        }

        #[getter]
        fn stack(&self) -> String {
            self.inner.stack.to_string()
        }

        #[getter]
        fn download_default(&self) -> String {
            self.inner.download_default.to_string()
        }

        #[getter]
        fn download_allowed(&self) -> Vec<String> {
            self.inner
                .download_allowed
                .iter()
                .map(|m| m.to_string())
                .collect()
        }

        #[getter]
        fn download_dir(&self) -> &str {
            self.inner.layout.download_dir
        }

        #[getter]
        fn slc_dir(&self) -> &str {
            self.inner.layout.slc_dir
        }

        #[getter]
        fn needs_unpack(&self) -> bool {
            self.inner.needs_unpack
        }

        #[getter]
        fn needs_orbit_download(&self) -> bool {
            self.inner.needs_orbit_download
        }

        fn __repr__(&self) -> String {
            format!("Satellite('{}')", self.inner.id)
        }
    }

    #[pyfunction]
    fn resolve_alias(name: &str) -> PyResult<Option<PySatellite>> {
        Ok(registry()?
            .resolve_alias(name)
            .map(|c| PySatellite { inner: c.clone() }))
    }

    #[pyfunction]
    fn detect_from_platform(platforms: &str) -> PyResult<PySatellite> {
        let config = registry()?.detect_from_platform(platforms).map_err(to_py_err)?;
        Ok(PySatellite {
            inner: config.clone(),
        })
    }

    #[pyfunction]
    fn detect_from_filename(path: &str) -> PyResult<Option<PySatellite>> {
        Ok(registry()?
            .detect_from_filename(path)
            .map(|c| PySatellite { inner: c.clone() }))
    }

    /// Resolved download method name for a satellite and optional request
    #[pyfunction]
    #[pyo3(signature = (satellite, method=None))]
    fn validate_download_method(satellite: &str, method: Option<&str>) -> PyResult<String> {
        let registry = registry()?;
        let config = registry.resolve_alias(satellite).ok_or_else(|| {
            to_py_err(MinsarError::UnknownSatellite(satellite.to_string()))
        })?;
        registry
            .validate_download_method(config, method)
            .map(|m| m.to_string())
            .map_err(to_py_err)
    }

    /// (region, satellite, direction, track) of a project name
    #[pyfunction]
    fn parse_project_name(name: &str) -> PyResult<(String, String, String, u32)> {
        let project = ProjectName::parse(name).map_err(to_py_err)?;
        Ok((
            project.region,
            project.satellite,
            project.direction.token().to_string(),
            project.track,
        ))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PySatellite>()?;
        m.add_function(wrap_pyfunction!(resolve_alias, m)?)?;
        m.add_function(wrap_pyfunction!(detect_from_platform, m)?)?;
        m.add_function(wrap_pyfunction!(detect_from_filename, m)?)?;
        m.add_function(wrap_pyfunction!(validate_download_method, m)?)?;
        m.add_function(wrap_pyfunction!(parse_project_name, m)?)?;
        Ok(())
    }
}
