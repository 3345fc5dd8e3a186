//! Helpers of the `skipnet` command line interface.
use std::{fmt, str::FromStr};

/// Per-sample input shape, written as comma separated dimensions, e.g. `28,28,1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputShape(pub Vec<usize>);

impl InputShape {
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

impl FromStr for InputShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dims = s
            .split(',')
            .map(|dim| match dim.trim().parse::<usize>() {
                Ok(0) | Err(_) => Err(format!("invalid dimension {:?} in {:?}", dim, s)),
                Ok(dim) => Ok(dim),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if dims.len() != 3 {
            return Err(format!(
                "expected height, width and channels, got {} dimensions",
                dims.len()
            ));
        }
        Ok(Self(dims))
    }
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(usize::to_string).collect();
        f.write_str(&dims.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_shape() {
        let shape: InputShape = "28,28,1".parse().unwrap();
        assert_eq!(shape.dims(), &[28, 28, 1]);
        assert_eq!(shape.to_string(), "28,28,1");
        assert_eq!(" 32, 32 ,3".parse(), Ok(InputShape(vec![32, 32, 3])));
    }

    #[test]
    fn test_reject_input_shape() {
        assert!("28,28".parse::<InputShape>().is_err());
        assert!("28,0,1".parse::<InputShape>().is_err());
        assert!("28,x,1".parse::<InputShape>().is_err());
        assert!("".parse::<InputShape>().is_err());
    }
}
