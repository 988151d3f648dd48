//! Pipeline domain model

use crate::core::{
    definition::PipelineDefinition,
    step::{validate_step_name, Step},
};
use crate::error::{PipelineError, Result};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// An ordered, validated graph of steps
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Pipeline name, the key the backend upserts under
    pub name: String,

    /// Steps in declaration order
    steps: Vec<Step>,

    /// Step execution order (topological sort)
    execution_order: Vec<String>,
}

impl Pipeline {
    /// Assemble a pipeline, validating the whole step graph.
    ///
    /// Rejects duplicate step names, dependencies on unknown steps, cycles,
    /// references to unknown steps or to steps that neither come earlier nor
    /// are declared dependencies (`InvalidDefinition`), and references to
    /// outputs the producing step does not declare (`OutputNameMismatch`).
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self> {
        let name = name.into();
        validate_step_name(&name)
            .map_err(|_| PipelineError::invalid(format!("Invalid pipeline name '{}'", name)))?;

        if steps.is_empty() {
            return Err(PipelineError::invalid(format!(
                "Pipeline '{}' has no steps",
                name
            )));
        }

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (position, step) in steps.iter().enumerate() {
            step.validate()?;
            if positions.insert(step.name.as_str(), position).is_some() {
                return Err(PipelineError::invalid(format!(
                    "Duplicate step name: {}",
                    step.name
                )));
            }
        }

        for (position, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                if !positions.contains_key(dep.as_str()) {
                    return Err(PipelineError::invalid(format!(
                        "Step '{}' depends on non-existent step '{}'",
                        step.name, dep
                    )));
                }
            }

            for reference in step.references() {
                let Some(&source_position) = positions.get(reference.step()) else {
                    return Err(PipelineError::invalid(format!(
                        "Step '{}' references non-existent step '{}'",
                        step.name,
                        reference.step()
                    )));
                };
                let source = &steps[source_position];

                if !source.produces(reference) {
                    return Err(match reference.output_name() {
                        Some(output) => PipelineError::OutputNameMismatch {
                            source_step: source.name.clone(),
                            output: output.to_string(),
                            declared: source.output_names(),
                        },
                        None => PipelineError::invalid(format!(
                            "Step '{}' takes model artifacts from '{}', which is a {} step",
                            step.name,
                            source.name,
                            source.kind.label()
                        )),
                    });
                }

                let declared = step.depends_on.iter().any(|d| d == reference.step());
                if !declared && source_position > position {
                    return Err(PipelineError::invalid(format!(
                        "Step '{}' references '{}', which is neither an earlier step nor a declared dependency",
                        step.name,
                        reference.step()
                    )));
                }
                if !declared {
                    warn!(
                        "Step '{}' references '{}' without declaring it in depends_on; ordering relies on step position only",
                        step.name,
                        reference.step()
                    );
                }
            }
        }

        Self::check_cycles(&steps)?;
        let execution_order = Self::topological_sort(&steps);

        Ok(Pipeline {
            name,
            steps,
            execution_order,
        })
    }

    /// Get a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Get execution order (topological sort)
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Render the definition submitted to the backend.
    ///
    /// `role_arn` is the execution role for steps that don't set their own.
    pub fn definition(&self, role_arn: &str) -> PipelineDefinition {
        PipelineDefinition::render(self, role_arn)
    }

    /// Upstream edges used for ordering: explicit dependencies plus references
    fn upstream(step: &Step) -> Vec<&str> {
        let mut upstream: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
        for reference in step.references() {
            if !upstream.contains(&reference.step()) {
                upstream.push(reference.step());
            }
        }
        upstream
    }

    /// Check for cycles in the step dependency graph
    fn check_cycles(steps: &[Step]) -> Result<()> {
        let by_name: HashMap<&str, &Step> = steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for step in steps {
            if !visited.contains(step.name.as_str()) {
                Self::dfs_check(step.name.as_str(), &by_name, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check<'a>(
        step_name: &'a str,
        by_name: &HashMap<&'a str, &'a Step>,
        visited: &mut HashSet<&'a str>,
        recursion_stack: &mut HashSet<&'a str>,
    ) -> Result<()> {
        visited.insert(step_name);
        recursion_stack.insert(step_name);

        if let Some(step) = by_name.get(step_name) {
            for dep in Self::upstream(step) {
                if recursion_stack.contains(dep) {
                    return Err(PipelineError::invalid(format!(
                        "Cycle detected in dependency graph involving step '{}'",
                        dep
                    )));
                }
                if !visited.contains(dep) {
                    if let Some((&key, _)) = by_name.get_key_value(dep) {
                        Self::dfs_check(key, by_name, visited, recursion_stack)?;
                    }
                }
            }
        }

        recursion_stack.remove(step_name);
        Ok(())
    }

    /// Topological sort that keeps declaration order wherever the graph allows
    fn topological_sort(steps: &[Step]) -> Vec<String> {
        let by_name: HashMap<&str, &Step> = steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        for step in steps {
            Self::visit(step.name.as_str(), &by_name, &mut visited, &mut result);
        }

        result
    }

    fn visit<'a>(
        step_name: &'a str,
        by_name: &HashMap<&'a str, &'a Step>,
        visited: &mut HashSet<&'a str>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(step_name) {
            return;
        }

        if let Some(step) = by_name.get(step_name) {
            for dep in Self::upstream(step) {
                if let Some((&key, _)) = by_name.get_key_value(dep) {
                    Self::visit(key, by_name, visited, result);
                }
            }
        }

        result.push(step_name.to_string());
    }
}
