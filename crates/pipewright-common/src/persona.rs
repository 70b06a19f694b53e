use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The four fixed roles of the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    Requirements,
    Coding,
    Testing,
    Documentation,
}

impl Persona {
    /// Execution order. Each persona consumes the outputs of every persona before it.
    pub const PIPELINE: [Persona; 4] = [
        Persona::Requirements,
        Persona::Coding,
        Persona::Testing,
        Persona::Documentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::Coding => "coding",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Requirements => "Requirements",
            Self::Coding => "Coding",
            Self::Testing => "Testing",
            Self::Documentation => "Documentation",
        }
    }

    /// Name of the artifact each persona persists on success.
    pub fn artifact_name(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements.json",
            Self::Coding => "scaffold.json",
            Self::Testing => "test_report.json",
            Self::Documentation => "documentation.json",
        }
    }

    /// Position in [`Persona::PIPELINE`].
    pub fn position(&self) -> usize {
        match self {
            Self::Requirements => 0,
            Self::Coding => 1,
            Self::Testing => 2,
            Self::Documentation => 3,
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Persona {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requirements" => Ok(Self::Requirements),
            "coding" => Ok(Self::Coding),
            "testing" => Ok(Self::Testing),
            "documentation" => Ok(Self::Documentation),
            _ => Err(format!("Invalid persona: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order_matches_position() {
        for (idx, persona) in Persona::PIPELINE.iter().enumerate() {
            assert_eq!(persona.position(), idx);
        }
    }

    #[test]
    fn test_artifact_names_are_distinct() {
        let mut names: Vec<_> = Persona::PIPELINE.iter().map(|p| p.artifact_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_persona_parse() {
        assert_eq!("coding".parse::<Persona>().unwrap(), Persona::Coding);
        assert!("review".parse::<Persona>().is_err());
    }
}
