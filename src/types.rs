//! Weaver type metadata: maps type names such as `rgba` or `normal_world`
//! to their structural description and back.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Vector,
    VectorB,
    VectorI,
    Sampler,
    Matrix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Semantics {
    None,
    Color,
    Texcoord,
    Position,
    Direction,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    None,
    Object,
    World,
    Camera,
    Screen,
    Tangent,
}

impl Space {
    pub const ALL: [Space; 5] = [
        Space::Object,
        Space::World,
        Space::Camera,
        Space::Screen,
        Space::Tangent,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Space::None => "",
            Space::Object => "object",
            Space::World => "world",
            Space::Camera => "camera",
            Space::Screen => "screen",
            Space::Tangent => "tangent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub base: BaseType,
    pub dimensions: u8,
    pub semantics: Semantics,
    pub space: Space,
    pub unit: bool,
    pub sampler_is_cube: bool,
}

impl TypeInfo {
    pub const fn new(base: BaseType, dimensions: u8) -> Self {
        Self {
            base,
            dimensions,
            semantics: Semantics::None,
            space: Space::None,
            unit: false,
            sampler_is_cube: false,
        }
    }

    pub const fn with_semantics(mut self, semantics: Semantics) -> Self {
        self.semantics = semantics;
        self
    }

    pub const fn in_space(mut self, space: Space) -> Self {
        self.space = space;
        self
    }

    pub const fn unit(mut self) -> Self {
        self.unit = true;
        self
    }

    const fn cube(mut self) -> Self {
        self.sampler_is_cube = true;
        self
    }

    /// True when an output of type `self` can feed an input of type `input`
    /// as is, because `input` only drops properties `self` carries.
    pub fn satisfies(&self, input: &TypeInfo) -> bool {
        if self.base != input.base
            || self.dimensions != input.dimensions
            || self.sampler_is_cube != input.sampler_is_cube
        {
            return false;
        }
        if input.semantics != Semantics::None && input.semantics != self.semantics {
            return false;
        }
        if input.space != Space::None && input.space != self.space {
            return false;
        }
        !input.unit || self.unit
    }
}

/// Name <-> metadata table. Built once and shared read-only.
#[derive(Debug, Clone)]
pub struct TypeTable {
    entries: Vec<(String, TypeInfo)>,
    by_name: HashMap<String, usize>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TypeTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut t = Self::empty();
        let dims = ["", "2", "3", "4"];
        for (i, suffix) in dims.iter().enumerate() {
            let n = i as u8 + 1;
            t.register(format!("float{suffix}"), TypeInfo::new(BaseType::Vector, n));
            t.register(format!("int{suffix}"), TypeInfo::new(BaseType::VectorI, n));
            t.register(format!("bool{suffix}"), TypeInfo::new(BaseType::VectorB, n));
        }
        t.register("float4x4", TypeInfo::new(BaseType::Matrix, 4));

        t.register("rgb", TypeInfo::new(BaseType::Vector, 3).with_semantics(Semantics::Color));
        t.register("rgba", TypeInfo::new(BaseType::Vector, 4).with_semantics(Semantics::Color));
        for n in 2..=4u8 {
            t.register(
                format!("texcoord{n}"),
                TypeInfo::new(BaseType::Vector, n).with_semantics(Semantics::Texcoord),
            );
        }
        t.register(
            "depth",
            TypeInfo::new(BaseType::Vector, 1).with_semantics(Semantics::Depth),
        );

        let position = TypeInfo::new(BaseType::Vector, 4).with_semantics(Semantics::Position);
        let direction = TypeInfo::new(BaseType::Vector, 3).with_semantics(Semantics::Direction);
        t.register("position4", position);
        t.register("direction", direction);
        t.register("normal", direction.unit());
        for space in Space::ALL {
            let s = space.suffix();
            t.register(format!("position4_{s}"), position.in_space(space));
            t.register(format!("direction_{s}"), direction.in_space(space));
            t.register(format!("normal_{s}"), direction.in_space(space).unit());
        }

        t.register("tex1d", TypeInfo::new(BaseType::Sampler, 1));
        t.register("tex2d", TypeInfo::new(BaseType::Sampler, 2));
        t.register("tex3d", TypeInfo::new(BaseType::Sampler, 3));
        t.register("texcube", TypeInfo::new(BaseType::Sampler, 3).cube());
        t
    }

    /// Adds or replaces a type. Registration order is kept for iteration.
    pub fn register(&mut self, name: impl Into<String>, info: TypeInfo) {
        let name = name.into();
        if let Some(&i) = self.by_name.get(&name) {
            self.entries[i].1 = info;
            return;
        }
        self.by_name.insert(name.clone(), self.entries.len());
        self.entries.push((name, info));
    }

    pub fn query_type_info(&self, name: &str) -> Option<&TypeInfo> {
        self.by_name.get(name).map(|&i| &self.entries[i].1)
    }

    /// First registered name carrying exactly `info`.
    pub fn query_type(&self, info: &TypeInfo) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, i)| i == info)
            .map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TypeInfo)> {
        self.entries.iter().map(|(n, i)| (n.as_str(), i))
    }
}
